use match_common::error::CommonError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("corpus error: {0}")]
    Corpus(String),
}
