use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use mill_core::{atomic_write_json_pretty, hashchain, ATTESTATION_FILE};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::FileOptions;

pub const ATTESTATION_SCHEMA_VERSION: &str = "task_attestation_v1";

/// What a completed task ran, enough to tell two runs apart.
pub struct AttestationInput<'a> {
    pub task_id: &'a str,
    pub tool: &'a str,
    pub descriptor_digest: &'a str,
    pub invocation_digest: &'a str,
    pub modules: &'a [String],
    pub commands: &'a [String],
    pub log_lines: &'a [String],
    pub exit_status: Option<i32>,
    pub completed_at: DateTime<Utc>,
}

/// Head of the hash chain over the task log lines, in order.
pub fn log_hashchain_head(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .fold(None, |head: Option<String>, line| Some(hashchain(head.as_deref(), line)))
}

pub fn task_attestation(input: &AttestationInput<'_>) -> Value {
    json!({
        "schema_version": ATTESTATION_SCHEMA_VERSION,
        "task_id": input.task_id,
        "tool": input.tool,
        "descriptor_digest": input.descriptor_digest,
        "invocation_digest": input.invocation_digest,
        "module_chain": input.modules,
        "commands": input.commands,
        "exit_status": input.exit_status,
        "task_log_hashchain_head": log_hashchain_head(input.log_lines),
        "task_log_lines": input.log_lines.len(),
        "completed_at": input.completed_at.to_rfc3339(),
    })
}

pub fn write_attestation(work_dir: &Path, payload: &Value) -> Result<PathBuf> {
    let path = work_dir.join(ATTESTATION_FILE);
    atomic_write_json_pretty(&path, payload)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Zips every regular file under `work_dir`, with paths relative to it.
/// Returns the number of files written.
pub fn build_debug_bundle(work_dir: &Path, out_path: &Path) -> Result<usize> {
    if !work_dir.is_dir() {
        return Err(anyhow!("work directory not found: {}", work_dir.display()));
    }
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let out_abs = fs::canonicalize(out_path.parent().unwrap_or(Path::new(".")))
        .ok()
        .and_then(|dir| out_path.file_name().map(|name| dir.join(name)));

    let file = fs::File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let opts = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut written = 0;
    for entry in walkdir::WalkDir::new(work_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if let Some(out_abs) = &out_abs {
            if fs::canonicalize(path).ok().as_ref() == Some(out_abs) {
                continue;
            }
        }
        let name = path
            .strip_prefix(work_dir)
            .map_err(|_| anyhow!("{} is outside {}", path.display(), work_dir.display()))?
            .to_string_lossy()
            .replace('\\', "/");
        zip.start_file(name, opts)?;
        let data = fs::read(path)?;
        zip.write_all(&data)?;
        written += 1;
    }

    zip.finish()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mill_core::ensure_dir;
    use std::io::Read;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            ensure_dir(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn attestation_records_chain_commands_and_log_head() {
        let modules = vec!["OutputTagger".to_string(), "base".to_string()];
        let commands = vec!["smooth a.nii".to_string()];
        let lines = vec!["setup".to_string(), "saved".to_string()];
        let payload = task_attestation(&AttestationInput {
            task_id: "task_1",
            tool: "smooth@1.0",
            descriptor_digest: "sha256:d",
            invocation_digest: "sha256:i",
            modules: &modules,
            commands: &commands,
            log_lines: &lines,
            exit_status: Some(0),
            completed_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("ts"),
        });
        assert_eq!(payload["schema_version"], ATTESTATION_SCHEMA_VERSION);
        assert_eq!(payload["module_chain"], json!(["OutputTagger", "base"]));
        let head = hashchain(Some(&hashchain(None, "setup")), "saved");
        assert_eq!(payload["task_log_hashchain_head"], json!(head));
        assert_eq!(log_hashchain_head(&[]), None);

        let root = TempDirGuard::new("mill_attest");
        let path = write_attestation(&root.path, &payload).expect("write");
        let parsed: Value =
            serde_json::from_slice(&fs::read(path).expect("read")).expect("parse");
        assert_eq!(parsed, payload);
    }

    #[test]
    fn bundle_contains_every_file_of_the_work_dir() {
        let root = TempDirGuard::new("mill_bundle");
        let work_dir = root.path.join("task_7");
        ensure_dir(&work_dir.join("results")).expect("results");
        fs::write(work_dir.join("invocation.json"), b"{}").expect("invocation");
        fs::write(work_dir.join("results").join("out.txt"), b"done").expect("out");

        let out = root.path.join("bundle.zip");
        assert_eq!(build_debug_bundle(&work_dir, &out).expect("bundle"), 2);

        let mut archive = zip::ZipArchive::new(fs::File::open(&out).expect("open")).expect("zip");
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).expect("entry").name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["invocation.json", "results/out.txt"]);
        let mut body = String::new();
        archive
            .by_name("results/out.txt")
            .expect("out entry")
            .read_to_string(&mut body)
            .expect("read entry");
        assert_eq!(body, "done");
    }

    #[test]
    fn bundling_a_missing_dir_fails() {
        let root = TempDirGuard::new("mill_bundle_missing");
        let err = match build_debug_bundle(&root.path.join("nope"), &root.path.join("b.zip")) {
            Ok(_) => panic!("missing dir should fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("work directory not found"));
    }
}
