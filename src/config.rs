//! Container runtime-configuration documents.
//!
//! The volume-create tool prints the base document for the new volume on
//! stdout. Before the container runs we replace its process with one that
//! imports the operator's certificates into the platform trust store, then
//! write the result to `config.json` in the bundle directory.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{InjectError, Result};

/// Fixed filename the container runner expects inside the bundle directory.
pub const CONFIG_FILENAME: &str = "config.json";

/// Runtime configuration for a container. Only the fields this tool
/// touches are typed; everything else the volume tool emits (root,
/// platform sections, annotations) is carried through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<MountSpec>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub cwd: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub destination: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Capability to produce the augmented runtime configuration for one
/// bundle directory from the base document and certificate material.
pub trait ConfigWriter: Send + Sync {
    fn write(&self, bundle_dir: &Path, base_document: &str, cert_data: &[u8]) -> Result<()>;
}

/// Writes `config.json` whose process imports the given certificates at
/// container start. Identical inputs produce byte-identical output:
/// serde_json re-serializes the carried-through fields in sorted key
/// order and the embedded script depends only on the certificate bytes.
pub struct BundleConfigWriter;

impl ConfigWriter for BundleConfigWriter {
    fn write(&self, bundle_dir: &Path, base_document: &str, cert_data: &[u8]) -> Result<()> {
        let mut config: RuntimeConfig =
            serde_json::from_str(base_document).map_err(InjectError::Document)?;

        config.process = Some(import_process(cert_data));

        let bytes = serde_json::to_vec(&config).map_err(|e| InjectError::Filesystem {
            context: format!("serialize {CONFIG_FILENAME}"),
            source: e.into(),
        })?;

        let path = bundle_dir.join(CONFIG_FILENAME);
        std::fs::write(&path, &bytes).map_err(|source| InjectError::Filesystem {
            context: format!("write {}", path.display()),
            source,
        })?;

        Ok(())
    }
}

/// Process specification that runs the trust-store import inside the
/// container. The certificate bytes are base64-embedded in a generated
/// PowerShell script; `-EncodedCommand` expects that script base64'd
/// over UTF-16LE, not UTF-8.
fn import_process(cert_data: &[u8]) -> ProcessSpec {
    let script = import_script(&BASE64.encode(cert_data));
    let utf16: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();

    ProcessSpec {
        args: vec![
            "powershell.exe".to_string(),
            "-EncodedCommand".to_string(),
            BASE64.encode(utf16),
        ],
        cwd: r"C:\".to_string(),
        extra: Map::new(),
    }
}

fn import_script(cert_data: &str) -> String {
    format!(
        r#"
$ErrorActionPreference = "Stop";
trap {{ $host.SetShouldExit(1) }}
$certFile=[System.IO.Path]::GetTempFileName()
$decodedCertData = [Convert]::FromBase64String("{cert_data}")
[IO.File]::WriteAllBytes($certFile, $decodedCertData)
Import-Certificate -CertStoreLocation Cert:\LocalMachine\Root -FilePath $certFile
Remove-Item $certFile
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const BASE_DOCUMENT: &str = r#"{
        "ociVersion": "1.0.1",
        "process": {"args": ["cmd.exe"], "cwd": "C:\\original"},
        "root": {"path": "c:\\volume\\path"},
        "windows": {"layerFolders": ["c:\\layer1", "c:\\layer2"]}
    }"#;

    fn written_config(cert_data: &[u8]) -> (TempDir, Vec<u8>) {
        let dir = TempDir::new().unwrap();
        BundleConfigWriter
            .write(dir.path(), BASE_DOCUMENT, cert_data)
            .unwrap();
        let bytes = std::fs::read(dir.path().join(CONFIG_FILENAME)).unwrap();
        (dir, bytes)
    }

    #[test]
    fn replaces_the_process_with_the_import_command() {
        let (_dir, bytes) = written_config(b"cert-bytes");
        let config: RuntimeConfig = serde_json::from_slice(&bytes).unwrap();

        let process = config.process.unwrap();
        assert_eq!(process.cwd, r"C:\");
        assert_eq!(process.args.len(), 3);
        assert_eq!(process.args[0], "powershell.exe");
        assert_eq!(process.args[1], "-EncodedCommand");

        // Decode back down to the script and check the cert made it in.
        let utf16 = BASE64.decode(&process.args[2]).unwrap();
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let script = String::from_utf16(&units).unwrap();
        assert!(script.contains("Import-Certificate"));
        assert!(script.contains(&BASE64.encode(b"cert-bytes")));
    }

    #[test]
    fn preserves_fields_it_does_not_set() {
        let (_dir, bytes) = written_config(b"cert-bytes");
        let config: RuntimeConfig = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(
            config.extra["root"]["path"],
            Value::from("c:\\volume\\path")
        );
        assert_eq!(
            config.extra["windows"]["layerFolders"][1],
            Value::from("c:\\layer2")
        );
        assert_eq!(config.extra["ociVersion"], Value::from("1.0.1"));
    }

    #[test]
    fn output_is_byte_identical_for_identical_inputs() {
        let (_a, first) = written_config(b"same-cert");
        let (_b, second) = written_config(b"same-cert");
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_base_document_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let err = BundleConfigWriter
            .write(dir.path(), "gibberish", b"cert")
            .unwrap_err();
        assert!(matches!(err, InjectError::Document(_)));
    }

    #[test]
    fn unwritable_destination_is_a_filesystem_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("no-such-subdir");
        let err = BundleConfigWriter
            .write(&missing, BASE_DOCUMENT, b"cert")
            .unwrap_err();
        assert!(matches!(err, InjectError::Filesystem { .. }));
    }

    #[test]
    fn mounts_round_trip() {
        let document = r#"{
            "mounts": [{"source": "c:\\certs", "destination": "c:\\import", "options": ["ro"]}]
        }"#;
        let dir = TempDir::new().unwrap();
        BundleConfigWriter.write(dir.path(), document, b"c").unwrap();

        let bytes = std::fs::read(dir.path().join(CONFIG_FILENAME)).unwrap();
        let config: RuntimeConfig = serde_json::from_slice(&bytes).unwrap();
        let mounts = config.mounts.unwrap();
        assert_eq!(mounts[0].source, "c:\\certs");
        assert_eq!(mounts[0].destination, "c:\\import");
        assert_eq!(mounts[0].extra["options"][0], Value::from("ro"));
    }
}
