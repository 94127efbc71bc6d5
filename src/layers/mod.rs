pub mod dense;
pub mod lstm;
pub mod ltau;

pub use dense::{DenseLayer, Layer};
pub use lstm::{LstmCell, LstmGradients};
pub use ltau::{LtauLayer, LtauGradients};
