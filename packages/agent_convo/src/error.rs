use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvoError {
    #[error("No message with id {0} has been started")]
    UnknownMessage(String),

    #[error("Message {0} already finished")]
    MessageFinished(String),

    #[error("Execution output received before any execution started")]
    NoActiveExecution,
}

pub type Result<T> = std::result::Result<T, ConvoError>;
