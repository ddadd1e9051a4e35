#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation Error: {0} should be {1}")]
    Validation(String, String),

    #[error("Shape Mismatch: {0} should be {1:?}, but got {2:?}")]
    ShapeMismatch(String, Vec<usize>, Vec<usize>),

    #[error("Singular Camera: the intrinsic matrix has determinant {0}")]
    SingularCamera(f64),

    #[error("Non-finite Camera: {0} contains NaN or infinity")]
    NonFiniteCamera(String),

    #[error("Tensor Data: {0}")]
    TensorData(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<burn::tensor::DataError> for Error {
    fn from(error: burn::tensor::DataError) -> Self {
        Self::TensorData(format!("{error:?}"))
    }
}
