use super::{IngestorError, ParsedOutput};
use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, error};
use wait_timeout::ChildExt;

/// External parser executable. Called as `<parser> <output file>` and expected
/// to print a JSON object of fields on stdout.
#[derive(Debug, Clone)]
pub struct ExecIngestor {
    pub parser: PathBuf,
    pub timeout: Duration,
}

impl ExecIngestor {
    pub fn new(parser: PathBuf, timeout: Duration) -> Self {
        Self { parser, timeout }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn extract(&self, output: &Path) -> Result<ParsedOutput, IngestorError> {
        let mut handle = Command::new(&self.parser)
            .arg(output)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(IngestorError::SpawnParser)?;

        debug!("Parser waiting on {}", handle.id());
        let status = match handle.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                debug!("Parser ran into timeout, killing it");
                // the child may have exited between the timeout and the kill
                let _ = handle.kill();
                let _ = handle.wait();

                return Err(IngestorError::ParserTimeout);
            }
        };

        let mut stdout = String::new();
        if let Some(mut pipe) = handle.stdout.take() {
            pipe.read_to_string(&mut stdout)?;
        }

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = handle.stderr.take() {
                pipe.read_to_string(&mut stderr)?;
            }

            error!(status = %status, "External parser failed");

            return Err(IngestorError::ParserFailed {
                status: status.to_string(),
                stderr,
            });
        }

        Ok(serde_json::from_str(&stdout)?)
    }
}
