use thiserror::Error;

#[derive(Error, Debug)]
pub enum CofferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of space: no free range of {0} blocks")]
    OutOfSpace(u32),
}

pub type Result<T> = std::result::Result<T, CofferError>;
