/// Errors that can occur in connector operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// `wait_for_incoming_message` accepts only immediate and indefinite
    /// deadlines; partial timeouts are deliberately unsupported.
    #[error("partial wait deadlines are not supported (use Immediate or Indefinite)")]
    DeadlineNotSupported,
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
