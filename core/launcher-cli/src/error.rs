use launcher_core::LauncherError;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{}", .0.user_message())]
    Core(#[from] LauncherError),

    #[error("Worker program exited with {}", code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")))]
    WorkerFailed { code: Option<i32> },

    #[error("{0}")]
    Refused(String),
}

pub type Result<T> = std::result::Result<T, CliError>;
