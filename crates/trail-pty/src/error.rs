use std::io;

#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error("no command given")]
    EmptyCommand,

    #[error("failed to allocate pseudo-terminal: {0}")]
    Pty(#[source] io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for child: {0}")]
    Wait(#[source] io::Error),
}

impl InterceptError {
    /// Exit status a shell would report for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Spawn { source, .. } if source.kind() == io::ErrorKind::NotFound => 127,
            Self::Spawn { .. } => 126,
            _ => 1,
        }
    }
}
