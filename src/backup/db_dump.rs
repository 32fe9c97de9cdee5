use async_trait::async_trait;
use chrono::Local;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};
use which::which;

use super::backup_filename;
use super::compress::gzip_stream_to_file;
use crate::errors::{BackupError, Result};
use crate::models::{DatabaseServerConfig, DbEngine};

/// A compressed dump sitting in the job's workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpFile {
    pub path: PathBuf,
    pub filename: String,
}

/// Produces one compressed dump per requested database.
///
/// Fails as a whole if any single database fails; callers never see a
/// partial list.
#[async_trait]
pub trait Dumper: Send + Sync {
    async fn dump(
        &self,
        server: &DatabaseServerConfig,
        databases: &[String],
        workspace_dir: &Path,
    ) -> Result<Vec<DumpFile>>;
}

/// Command line for one database dump. Credentials travel in `env` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpCommand {
    pub program: &'static str,
    pub args: Vec<String>,
    pub env: Vec<(&'static str, String)>,
}

impl DumpCommand {
    pub fn for_database(server: &DatabaseServerConfig, database: &str) -> Self {
        match server.engine {
            DbEngine::Mysql => DumpCommand {
                program: "mysqldump",
                args: vec![
                    format!("-h{}", server.host),
                    format!("-P{}", server.port),
                    format!("-u{}", server.username),
                    "--single-transaction".to_string(),
                    "--routines".to_string(),
                    "--triggers".to_string(),
                    database.to_string(),
                ],
                env: vec![("MYSQL_PWD", server.password.clone())],
            },
            DbEngine::Postgres => DumpCommand {
                program: "pg_dump",
                args: vec![
                    "-h".to_string(),
                    server.host.clone(),
                    "-p".to_string(),
                    server.port.to_string(),
                    "-U".to_string(),
                    server.username.clone(),
                    "-F".to_string(),
                    "p".to_string(),
                    database.to_string(),
                ],
                env: vec![("PGPASSWORD", server.password.clone())],
            },
        }
    }

    /// Printable form, without the environment.
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Runs `mysqldump` / `pg_dump` and gzips their stdout in-process.
#[derive(Debug, Clone, Default)]
pub struct ProcessDumper {
    mysqldump: Option<PathBuf>,
    pg_dump: Option<PathBuf>,
}

impl ProcessDumper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit executable for `engine` instead of searching `PATH`.
    pub fn with_program(mut self, engine: DbEngine, program: impl Into<PathBuf>) -> Self {
        match engine {
            DbEngine::Mysql => self.mysqldump = Some(program.into()),
            DbEngine::Postgres => self.pg_dump = Some(program.into()),
        }
        self
    }

    fn program_for(&self, engine: DbEngine) -> Result<PathBuf> {
        let configured = match engine {
            DbEngine::Mysql => self.mysqldump.clone(),
            DbEngine::Postgres => self.pg_dump.clone(),
        };
        if let Some(path) = configured {
            return Ok(path);
        }
        let name = match engine {
            DbEngine::Mysql => "mysqldump",
            DbEngine::Postgres => "pg_dump",
        };
        which(name).map_err(|_| {
            BackupError::config(format!(
                "{} executable not found in PATH. Please ensure the {} client tools are installed and in your PATH.",
                name,
                engine.as_str()
            ))
        })
    }
}

#[async_trait]
impl Dumper for ProcessDumper {
    async fn dump(
        &self,
        server: &DatabaseServerConfig,
        databases: &[String],
        workspace_dir: &Path,
    ) -> Result<Vec<DumpFile>> {
        let program = self.program_for(server.engine)?;
        let today = Local::now().date_naive();
        let mut dumped = Vec::with_capacity(databases.len());

        for database in databases {
            let filename = backup_filename(database, today);
            let path = workspace_dir.join(&filename);
            let command = DumpCommand::for_database(server, database);
            info!(database = %database, path = %path.display(), "Creating {} backup", server.engine.as_str());
            debug!(command = %command.display(), "Running dump command");

            let program = program.clone();
            let target = path.clone();
            let db_name = database.clone();
            tokio::task::spawn_blocking(move || run_dump(&program, &command, &db_name, &target)).await??;

            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            info!(database = %database, bytes = size, "✓ Created backup {}", filename);
            dumped.push(DumpFile { path, filename });
        }

        Ok(dumped)
    }
}

/// Runs one dump to completion. A non-zero exit or a missing/empty output
/// file is a failure for `database`.
fn run_dump(program: &Path, command: &DumpCommand, database: &str, dest: &Path) -> Result<()> {
    let mut child = Command::new(program)
        .args(&command.args)
        .envs(command.env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BackupError::dump(database, format!("failed to start {}: {}", command.program, e)))?;

    // Drain stderr on its own thread so a chatty tool cannot block on a full pipe.
    let stderr_reader = child.stderr.take().map(|mut stderr| {
        std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            buf
        })
    });

    let compressed = match child.stdout.take() {
        Some(mut stdout) => gzip_stream_to_file(&mut stdout, dest),
        None => Err(BackupError::dump(database, "dump process has no stdout")),
    };

    let status = child
        .wait()
        .map_err(|e| BackupError::dump(database, format!("failed to wait for {}: {}", command.program, e)))?;
    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    if !status.success() {
        let detail = stderr.trim();
        return Err(BackupError::dump(
            database,
            format!(
                "{} exited with {}: {}",
                command.program,
                status,
                if detail.is_empty() { "Unknown error" } else { detail }
            ),
        ));
    }
    compressed.map_err(|e| BackupError::dump(database, format!("compression failed: {}", e)))?;

    match std::fs::metadata(dest) {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(BackupError::dump(
            database,
            format!("Backup file was not created properly: {}", dest.display()),
        )),
    }
}
