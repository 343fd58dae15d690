//! Compiler backends turn program listings into executable programs.
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use tempfile::NamedTempFile;

use crate::compiler::instructions::Program;
use crate::compiler::listing::assemble;
use crate::error::{Diagnostic, Error, ErrorKind};
use crate::generator::GeneratedProgram;

/// Options passed to a backend per compilation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendOptions {
    /// Load artifacts into memory and delete them right away.
    pub disable_artifact_locking: bool,
}

/// A temporary file produced by a compilation.
///
/// The file is deleted when the artifact is dropped, which happens when
/// the compiled template is evicted from the cache or the engine is
/// disposed.
pub struct Artifact {
    file: NamedTempFile,
}

impl Artifact {
    /// Returns the path of the artifact on disk.
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("path", &self.path())
            .finish()
    }
}

/// The result of a successful compilation.
#[derive(Debug)]
pub struct CompiledUnit {
    /// The executable program.
    pub program: Program,
    /// The artifact backing the program if the backend keeps one.
    pub artifact: Option<Artifact>,
    /// Warnings reported by the backend.
    pub diagnostics: Vec<Diagnostic>,
}

/// Compiles generated program text into executable programs.
pub trait CompilerBackend: Send + Sync {
    /// Compiles a program.
    ///
    /// Rejected programs fail with [`ErrorKind::CompileError`] and carry
    /// one diagnostic per problem.
    fn compile(
        &self,
        program: &GeneratedProgram,
        options: &BackendOptions,
    ) -> Result<CompiledUnit, Error>;

    /// Releases resources held by the backend.
    fn dispose(&self) {}
}

/// Assembles listings in memory.
///
/// This is the default backend.  It never touches the file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssemblerBackend;

impl CompilerBackend for AssemblerBackend {
    fn compile(
        &self,
        program: &GeneratedProgram,
        _options: &BackendOptions,
    ) -> Result<CompiledUnit, Error> {
        Ok(CompiledUnit {
            program: ok!(assemble(&program.text)),
            artifact: None,
            diagnostics: Vec::new(),
        })
    }
}

/// Writes listings to temporary artifact files and assembles them from
/// disk.
///
/// In the default locked mode every compiled template keeps its artifact
/// file open until it is evicted.  With
/// [`disable_artifact_locking`](crate::EngineConfig::disable_artifact_locking)
/// the artifact is read back into memory and deleted before `compile`
/// returns.
#[derive(Debug, Default, Clone)]
pub struct ArtifactBackend {
    dir: Option<std::path::PathBuf>,
}

impl ArtifactBackend {
    /// Creates a backend writing to the system temp directory.
    pub fn new() -> ArtifactBackend {
        ArtifactBackend::default()
    }

    /// Creates a backend writing into a specific directory.
    pub fn with_dir<P: AsRef<Path>>(dir: P) -> ArtifactBackend {
        ArtifactBackend {
            dir: Some(dir.as_ref().to_path_buf()),
        }
    }

    fn create_file(&self) -> std::io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("minirazor-").suffix(".rzasm");
        match self.dir {
            Some(ref dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
    }
}

fn artifact_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::CompileError, "could not write compilation artifact").with_source(err)
}

impl CompilerBackend for ArtifactBackend {
    fn compile(
        &self,
        program: &GeneratedProgram,
        options: &BackendOptions,
    ) -> Result<CompiledUnit, Error> {
        let now = Instant::now();
        let mut file = ok!(self.create_file().map_err(artifact_error));
        ok!(file
            .write_all(program.text.as_bytes())
            .and_then(|_| file.flush())
            .map_err(artifact_error));
        let text = ok!(fs::read_to_string(file.path()).map_err(artifact_error));
        let assembled = assemble(&text);
        let artifact = if options.disable_artifact_locking {
            let path = file.path().to_path_buf();
            ok!(file.close().map_err(artifact_error));
            tracing::trace!(path = %path.display(), "deleted unlocked artifact");
            None
        } else {
            Some(Artifact { file })
        };
        let program = ok!(assembled);
        tracing::debug!(
            elapsed = ?now.elapsed(),
            locked = artifact.is_some(),
            "assembled program from artifact"
        );
        Ok(CompiledUnit {
            program,
            artifact,
            diagnostics: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> GeneratedProgram {
        GeneratedProgram {
            text: ".template \"x\"\n.main\n   1 emit_raw \"hi\"\n.end\n".into(),
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn test_locked_artifact_lives_with_unit() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ArtifactBackend::with_dir(dir.path());
        let unit = backend
            .compile(&listing(), &BackendOptions::default())
            .unwrap();
        let path = unit.artifact.as_ref().unwrap().path().to_path_buf();
        assert!(path.exists());
        assert!(path.to_string_lossy().ends_with(".rzasm"));
        drop(unit);
        assert!(!path.exists());
    }

    #[test]
    fn test_unlocked_artifact_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ArtifactBackend::with_dir(dir.path());
        let unit = backend
            .compile(
                &listing(),
                &BackendOptions {
                    disable_artifact_locking: true,
                },
            )
            .unwrap();
        assert!(unit.artifact.is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_assembly_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ArtifactBackend::with_dir(dir.path());
        let err = backend
            .compile(
                &GeneratedProgram {
                    text: "garbage".into(),
                    diagnostics: Vec::new(),
                },
                &BackendOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompileError);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
