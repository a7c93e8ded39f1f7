use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),

    /// Checksum or magic number mismatch. WAL corruption is recovered by
    /// truncation; table corruption is surfaced to the reader and the table
    /// is excluded from later reads; manifest corruption fails `open`.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Contract violation on the table-writer input. A defect, not a
    /// transient condition.
    #[error("format: {0}")]
    Format(String),

    #[error("engine is closed")]
    Closed,

    #[error("{0}")]
    Custom(String),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Io(_), Self::Io(_)) | (Self::Closed, Self::Closed) => true,
            (Self::Corruption(s1), Self::Corruption(s2))
            | (Self::Format(s1), Self::Format(s2))
            | (Self::Custom(s1), Self::Custom(s2)) => s1.eq(s2),
            _ => false,
        }
    }
}
