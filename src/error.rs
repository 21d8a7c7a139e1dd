//! Engine-level error type
//!
//! Every fatal condition the render pipeline can hit (resource construction,
//! shader/uniform mismatches, incomplete framebuffers) is reported through
//! [`EngineError`], which records where in the engine it was raised.

use crate::backend::{BackendError, FramebufferStatus};
use crate::resources::ShaderKind;
use std::fmt;
use std::panic::Location;
use std::path::PathBuf;
use thiserror::Error;

/// What went wrong
#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("shader {kind:?} failed to compile: {message}")]
    ShaderCompile { kind: ShaderKind, message: String },
    #[error("shader {kind:?} failed to link: {message}")]
    ShaderLink { kind: ShaderKind, message: String },
    #[error("shader {kind:?} has no uniform named `{name}`")]
    MissingUniform { kind: ShaderKind, name: String },
    #[error("shader {kind:?} has no texture binding named `{name}`")]
    MissingTexture { kind: ShaderKind, name: String },
    #[error("failed to load texture {}: {reason}", path.display())]
    TextureLoad { path: PathBuf, reason: String },
    #[error("failed to load mesh {}: {reason}", path.display())]
    MeshLoad { path: PathBuf, reason: String },
    #[error("framebuffer `{label}` is incomplete: {status:?}")]
    FramebufferIncomplete {
        label: String,
        status: FramebufferStatus,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Fatal engine error carrying the source location where it was raised
pub struct EngineError {
    kind: ErrorKind,
    location: &'static Location<'static>,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            location: Location::caller(),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl From<ErrorKind> for EngineError {
    #[track_caller]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<BackendError> for EngineError {
    #[track_caller]
    fn from(err: BackendError) -> Self {
        Self::new(ErrorKind::Backend(err))
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (at {}:{})",
            self.kind,
            self.location.file(),
            self.location.line()
        )
    }
}

impl fmt::Debug for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineError")
            .field("kind", &self.kind)
            .field("location", &format_args!("{}", self.location))
            .finish()
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Backend(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_path_and_location() {
        let err = EngineError::new(ErrorKind::TextureLoad {
            path: PathBuf::from("textures/missing.png"),
            reason: "not found".into(),
        });
        let msg = err.to_string();
        assert!(msg.contains("textures/missing.png"));
        assert!(msg.contains("error.rs"));
    }

    #[test]
    fn test_backend_error_converts_with_caller_location() {
        fn fails() -> EngineResult<()> {
            Err::<(), _>(BackendError::OutOfMemory)?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Backend(BackendError::OutOfMemory)));
        assert_eq!(err.location().file(), file!());
    }
}
