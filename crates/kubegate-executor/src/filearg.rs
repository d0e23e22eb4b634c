//! Base64 substitution of kubectl file arguments.
//!
//! The client cannot hand the agent a local path, so the value of every
//! `-f`/`--filename` argument is replaced by the file's base64 content
//! before sending. The agent reverses this, writing each payload to a
//! temporary `.yaml` file and pointing the argument at it.
//!
//! Recognised forms: `-f <v>`, `-f=<v>`, `--filename <v>`,
//! `--filename=<v>`. The `=` forms are rewritten to `--filename=<v>`.
//! Values starting with `-` (stdin) and `http(s)://` URLs are left alone.
//! Nothing after a bare `logs` token is touched, since `kubectl logs -f`
//! means follow.

use std::path::PathBuf;

use base64::{Engine, engine::general_purpose::STANDARD};
use tempfile::NamedTempFile;
use thiserror::Error;

const SHORT_FLAG: &str = "-f";
const LONG_FLAG: &str = "--filename";
const FOLLOW_COMMANDS: [&str; 2] = ["logs", "log"];

/// File argument substitution error.
#[derive(Debug, Error)]
pub enum FileArgError {
    #[error("Failed to read file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode base64 file content: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("Failed to write temporary file: {0}")]
    TempFile(#[from] std::io::Error),
}

/// Arguments with decoded file payloads.
///
/// The temporary files are deleted when this value is dropped, so keep it
/// alive until the command using `args` has exited.
#[derive(Debug)]
pub struct DecodedArgs {
    pub args: Vec<String>,
    files: Vec<NamedTempFile>,
}

impl DecodedArgs {
    /// Paths of the temporary files backing the arguments.
    pub fn files(&self) -> impl Iterator<Item = &std::path::Path> {
        self.files.iter().map(NamedTempFile::path)
    }
}

/// Encode bytes with the standard padded alphabet.
#[must_use]
pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode standard padded base64.
///
/// # Errors
/// Returns error if the input is not valid base64.
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, FileArgError> {
    Ok(STANDARD.decode(encoded)?)
}

/// Replace every file argument value with the file's base64 content.
///
/// # Errors
/// Returns error if a referenced file cannot be read.
pub fn encode_file_args(args: &[String]) -> Result<Vec<String>, FileArgError> {
    substitute(args, |path| {
        let data = std::fs::read(path).map_err(|source| FileArgError::Read {
            path: PathBuf::from(path),
            source,
        })?;
        tracing::debug!(path, bytes = data.len(), "Encoded file argument");
        Ok(encode_base64(&data))
    })
}

/// Replace every base64 file argument value with a temporary file path.
///
/// # Errors
/// Returns error if a payload is not valid base64 or cannot be written.
pub fn decode_file_args(args: &[String]) -> Result<DecodedArgs, FileArgError> {
    let mut files = Vec::new();
    let args = substitute(args, |encoded| {
        let data = decode_base64(encoded)?;
        let mut file = tempfile::Builder::new()
            .prefix("decoded-file-")
            .suffix(".yaml")
            .tempfile()?;
        std::io::Write::write_all(&mut file, &data)?;
        let path = file.path().to_string_lossy().into_owned();
        tracing::debug!(path = %path, bytes = data.len(), "Decoded file argument");
        files.push(file);
        Ok(path)
    })?;
    Ok(DecodedArgs { args, files })
}

fn substitute<F>(args: &[String], mut replace: F) -> Result<Vec<String>, FileArgError>
where
    F: FnMut(&str) -> Result<String, FileArgError>,
{
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if FOLLOW_COMMANDS.contains(&arg.as_str()) {
            out.push(arg.clone());
            out.extend(iter.by_ref().cloned());
            break;
        }
        if arg == SHORT_FLAG || arg == LONG_FLAG {
            out.push(arg.clone());
            if let Some(value) = iter.next_if(|value| !value.starts_with('-')) {
                out.push(if is_remote(value) {
                    value.clone()
                } else {
                    replace(value)?
                });
            }
            continue;
        }

        let inline = arg
            .strip_prefix("-f=")
            .or_else(|| arg.strip_prefix("--filename="));
        match inline {
            Some(value) if !value.is_empty() && !value.starts_with('-') && !is_remote(value) => {
                out.push(format!("{LONG_FLAG}={}", replace(value)?));
            }
            _ => out.push(arg.clone()),
        }
    }
    Ok(out)
}

fn is_remote(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_base64_round_trip() {
        let large: Vec<u8> = (0..(1024 * 1024 + 17)).map(|i| (i % 251) as u8).collect();
        for data in [Vec::new(), b"apiVersion: v1\nkind: Pod\n".to_vec(), large] {
            assert_eq!(decode_base64(&encode_base64(&data)).unwrap(), data);
        }
        assert_eq!(encode_base64(b""), "");
    }

    #[test]
    fn test_encode_all_flag_forms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pod.yaml");
        std::fs::write(&path, "kind: Pod").unwrap();
        let path = path.to_str().unwrap();
        let encoded = encode_base64(b"kind: Pod");

        let out = encode_file_args(&args(&["apply", "-f", path])).unwrap();
        assert_eq!(out, args(&["apply", "-f", &encoded]));

        let out = encode_file_args(&args(&["apply", "--filename", path])).unwrap();
        assert_eq!(out, args(&["apply", "--filename", &encoded]));

        let out = encode_file_args(&args(&["apply", &format!("-f={path}")])).unwrap();
        assert_eq!(out, args(&["apply", &format!("--filename={encoded}")]));

        let out = encode_file_args(&args(&["apply", &format!("--filename={path}")])).unwrap();
        assert_eq!(out, args(&["apply", &format!("--filename={encoded}")]));
    }

    #[test]
    fn test_encode_leaves_other_args() {
        let input = args(&[
            "get",
            "pods",
            "--field-selector=status.phase=Running",
            "-f",
            "-",
            "--force",
        ]);
        assert_eq!(encode_file_args(&input).unwrap(), input);

        let remote = args(&["apply", "-f", "https://example.com/pod.yaml"]);
        assert_eq!(encode_file_args(&remote).unwrap(), remote);
    }

    #[test]
    fn test_logs_follow_flag_is_not_a_file() {
        for input in [
            args(&["logs", "-f", "web-0"]),
            args(&["--kubeconfig", "/etc/kube/config", "logs", "-f", "web-0", "-c", "app"]),
            args(&["log", "-f=true", "web-0"]),
        ] {
            assert_eq!(encode_file_args(&input).unwrap(), input);
            let decoded = decode_file_args(&input).unwrap();
            assert_eq!(decoded.args, input);
            assert_eq!(decoded.files().count(), 0);
        }
    }

    #[test]
    fn test_file_named_logs_is_still_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs");
        std::fs::write(&path, "kind: Job").unwrap();
        let path = path.to_str().unwrap();

        let out = encode_file_args(&args(&["apply", "-f", path])).unwrap();
        assert_eq!(out, args(&["apply", "-f", &encode_base64(b"kind: Job")]));
    }

    #[test]
    fn test_encode_missing_file() {
        let err = encode_file_args(&args(&["apply", "-f", "/nonexistent/kubegate.yaml"])).unwrap_err();
        assert!(matches!(err, FileArgError::Read { .. }));
    }

    #[test]
    fn test_decode_writes_temp_files() {
        let encoded = encode_base64(b"kind: Service");
        let decoded =
            decode_file_args(&args(&["apply", "-f", &encoded, &format!("--filename={encoded}")]))
                .unwrap();

        let paths: Vec<_> = decoded.files().map(std::path::Path::to_path_buf).collect();
        assert_eq!(paths.len(), 2);
        assert_eq!(decoded.args[2], paths[0].to_str().unwrap());
        assert_eq!(
            decoded.args[3],
            format!("--filename={}", paths[1].to_str().unwrap())
        );
        for path in &paths {
            assert_eq!(std::fs::read(path).unwrap(), b"kind: Service");
            assert_eq!(path.extension().unwrap(), "yaml");
        }

        drop(decoded);
        assert!(paths.iter().all(|path| !path.exists()));
    }

    #[test]
    fn test_decode_invalid_payload() {
        let err = decode_file_args(&args(&["apply", "-f", "not base64!"])).unwrap_err();
        assert!(matches!(err, FileArgError::Decode(_)));
    }
}
