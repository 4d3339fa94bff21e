//! Writing bundles to disk

use certsync_core::agent::CertBundle;
use certsync_core::model::FileMapping;
use certsync_core::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Mode of the private key file
#[cfg(unix)]
const KEY_MODE: u32 = 0o600;

/// Mode of certificate files
#[cfg(unix)]
const CERT_MODE: u32 = 0o644;

/// Write `bundle` under `deploy_path` using `mapping` for the filenames
///
/// All three files are staged as temporary siblings before any of them is
/// renamed into place, so a failed write leaves the previous key and
/// certificate untouched. The key is renamed first; the leaf and chain
/// follow. On unix the key is created with mode 0600.
pub async fn deploy_bundle(
    deploy_path: &Path,
    mapping: &FileMapping,
    bundle: &CertBundle,
) -> Result<()> {
    fs::create_dir_all(deploy_path).await.map_err(|e| {
        Error::Other(format!(
            "Failed to create deploy directory {}: {}",
            deploy_path.display(),
            e
        ))
    })?;

    let files = [
        (target(deploy_path, &mapping.key)?, bundle.key.as_str(), true),
        (target(deploy_path, &mapping.cert)?, bundle.cert.as_str(), false),
        (target(deploy_path, &mapping.fullchain)?, bundle.fullchain.as_str(), false),
    ];

    let mut staged = Vec::with_capacity(files.len());
    for (path, contents, private) in &files {
        let temp = temp_path(path);
        if let Err(e) = stage(&temp, contents, *private).await {
            discard(&staged).await;
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }
        staged.push((temp, path));
    }

    for (temp, path) in &staged {
        fs::rename(temp, path).await.map_err(|e| {
            Error::Other(format!(
                "Failed to move {} into place: {}",
                path.display(),
                e
            ))
        })?;
    }

    debug!(
        cert_id = %bundle.id,
        path = %deploy_path.display(),
        "Bundle written"
    );
    Ok(())
}

/// `deploy_path/name`, refusing names that would escape the directory
fn target(deploy_path: &Path, name: &str) -> Result<PathBuf> {
    let file_name = Path::new(name);
    let mut components = file_name.components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(deploy_path.join(file_name)),
        _ => Err(Error::invalid_input(format!(
            "File mapping entry '{}' must be a plain file name",
            name
        ))),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    PathBuf::from(temp)
}

async fn stage(temp: &Path, contents: &str, private: bool) -> Result<()> {
    let mut file = create(temp, private).await.map_err(|e| {
        Error::Other(format!("Failed to create {}: {}", temp.display(), e))
    })?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

async fn discard(staged: &[(PathBuf, &PathBuf)]) {
    for (temp, _) in staged {
        if let Err(e) = fs::remove_file(temp).await {
            debug!(path = %temp.display(), "Failed to remove staged file: {}", e);
        }
    }
}

#[cfg(unix)]
async fn create(path: &Path, private: bool) -> std::io::Result<fs::File> {
    use std::os::unix::fs::PermissionsExt;

    let mode = if private { KEY_MODE } else { CERT_MODE };
    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .await?;
    // A leftover temp file keeps its old mode; reset it
    file.set_permissions(std::fs::Permissions::from_mode(mode))
        .await?;
    Ok(file)
}

#[cfg(not(unix))]
async fn create(path: &Path, _private: bool) -> std::io::Result<fs::File> {
    fs::File::create(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bundle() -> CertBundle {
        CertBundle {
            id: "c1".to_string(),
            domain: "example.com".to_string(),
            fingerprint: "aa".to_string(),
            cert: "LEAF".to_string(),
            key: "KEY".to_string(),
            ca: "CA".to_string(),
            fullchain: "LEAF\nCA".to_string(),
        }
    }

    #[tokio::test]
    async fn test_default_mapping() {
        let dir = tempdir().unwrap();
        let deploy = dir.path().join("ssl/example.com");

        deploy_bundle(&deploy, &FileMapping::default(), &bundle())
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(deploy.join("cert.pem")).unwrap(), "LEAF");
        assert_eq!(std::fs::read_to_string(deploy.join("key.pem")).unwrap(), "KEY");
        assert_eq!(
            std::fs::read_to_string(deploy.join("fullchain.pem")).unwrap(),
            "LEAF\nCA"
        );
        assert!(!deploy.join("key.pem.tmp").exists());
    }

    #[tokio::test]
    async fn test_custom_mapping_overwrites() {
        let dir = tempdir().unwrap();
        let mapping = FileMapping {
            cert: "site.crt".to_string(),
            key: "site.key".to_string(),
            fullchain: "site.chain.crt".to_string(),
        };
        std::fs::write(dir.path().join("site.crt"), "OLD").unwrap();

        deploy_bundle(dir.path(), &mapping, &bundle()).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("site.crt")).unwrap(), "LEAF");
    }

    #[tokio::test]
    async fn test_mapping_cannot_escape_deploy_path() {
        let dir = tempdir().unwrap();
        let mapping = FileMapping {
            key: "../stolen.key".to_string(),
            ..FileMapping::default()
        };
        let err = deploy_bundle(dir.path(), &mapping, &bundle()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("key.pem"), "OLD KEY").unwrap();
        std::fs::write(dir.path().join("cert.pem"), "OLD LEAF").unwrap();
        // The chain cannot be staged while a directory holds its temp name
        std::fs::create_dir(dir.path().join("fullchain.pem.tmp")).unwrap();

        let err = deploy_bundle(dir.path(), &FileMapping::default(), &bundle()).await;
        assert!(err.is_err());

        assert_eq!(std::fs::read_to_string(dir.path().join("key.pem")).unwrap(), "OLD KEY");
        assert_eq!(std::fs::read_to_string(dir.path().join("cert.pem")).unwrap(), "OLD LEAF");
        assert!(!dir.path().join("key.pem.tmp").exists());
        assert!(!dir.path().join("cert.pem.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_key_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        deploy_bundle(dir.path(), &FileMapping::default(), &bundle())
            .await
            .unwrap();

        let key_mode = std::fs::metadata(dir.path().join("key.pem"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o777, 0o600);
        let cert_mode = std::fs::metadata(dir.path().join("cert.pem"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(cert_mode & 0o777, 0o644);
    }
}
