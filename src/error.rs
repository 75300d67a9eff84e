use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Workbook error: {0}")]
    Workbook(#[from] calamine::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Duplicate keys in {table} batch: {groups} conflicting key group(s), sync aborted")]
    DuplicateKeys { table: String, groups: usize },

    #[error("Constraint violation on {table}: {message}")]
    ConstraintViolation { table: String, message: String },

    #[error("Operator prompt failed: {0}")]
    Prompt(#[from] dialoguer::Error),
}

impl AppError {
    /// Re-label a database error raised while writing `table`, so that unique
    /// key violations surface as `ConstraintViolation`.
    pub fn from_write(table: &str, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return AppError::ConstraintViolation {
                    table: table.to_string(),
                    message: db_err.message().to_string(),
                };
            }
        }
        AppError::Database(err)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
