pub mod load;
pub mod proto;
pub mod save;

pub use load::load_onnx;
pub use save::{save_onnx, save_onnx_with, SaveOptions};
