//! Certificate tree authenticating a TLS live-migration stream.
//!
//! The source host generates the tree under the guest's `pki` directory and ships the
//! files to the destination, which installs them under its own `pki` directory before
//! launching with deferred incoming migration.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use hostman_cmd::{Command, CommandError};
use thiserror::Error;
use tracing::info;

use crate::fs::{self, FsError};

pub const CA_CERT: &str = "ca-cert.pem";
pub const CA_KEY: &str = "ca-key.pem";

/// Every file of the tree; nothing else is accepted from a peer.
pub const CERT_FILES: [&str; 6] = [
    CA_CERT,
    CA_KEY,
    "server-cert.pem",
    "server-key.pem",
    "client-cert.pem",
    "client-key.pem",
];

const LEAVES: [&str; 2] = ["server", "client"];
const CERT_DAYS: &str = "3650";

pub type MigrateCerts = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum CertsError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("failed to generate {name}")]
    Generate {
        name: String,
        #[source]
        source: CommandError,
    },

    #[error("unexpected certificate file: {0}")]
    UnknownFile(String),

    #[error("certificate bundle is missing {0}")]
    MissingFile(&'static str),
}

fn is_key(name: &str) -> bool {
    name.ends_with("-key.pem")
}

async fn openssl(pki_dir: &Path, name: &str, args: &[&str]) -> Result<(), CertsError> {
    Command::new("openssl")
        .args(args)
        .current_dir(pki_dir)
        .run()
        .await
        .map(|_| ())
        .map_err(|source| CertsError::Generate {
            name: name.to_owned(),
            source,
        })
}

async fn generate_ca(pki_dir: &Path) -> Result<(), CertsError> {
    openssl(
        pki_dir,
        CA_CERT,
        &[
            "req", "-x509", "-newkey", "rsa:2048", "-nodes",
            "-keyout", CA_KEY, "-out", CA_CERT,
            "-days", CERT_DAYS, "-subj", "/CN=hostman-migrate-ca",
        ],
    )
    .await
}

async fn generate_leaf(pki_dir: &Path, leaf: &str) -> Result<(), CertsError> {
    let key = format!("{leaf}-key.pem");
    let cert = format!("{leaf}-cert.pem");
    let csr = format!("{leaf}.csr");
    let subject = format!("/CN=hostman-migrate-{leaf}");

    openssl(
        pki_dir,
        &cert,
        &[
            "req", "-newkey", "rsa:2048", "-nodes",
            "-keyout", &key, "-out", &csr, "-subj", &subject,
        ],
    )
    .await?;
    openssl(
        pki_dir,
        &cert,
        &[
            "x509", "-req", "-in", &csr,
            "-CA", CA_CERT, "-CAkey", CA_KEY, "-CAcreateserial",
            "-out", &cert, "-days", CERT_DAYS,
        ],
    )
    .await?;
    fs::remove_file_if_exists(pki_dir.join(&csr)).await?;
    Ok(())
}

/// Creates whatever part of the tree is missing and returns every file's content.
#[tracing::instrument(skip_all, fields(pki_dir = %pki_dir.display()))]
pub async fn prepare_migrate_certs(pki_dir: &Path) -> Result<MigrateCerts, CertsError> {
    fs::create_dir(pki_dir).await?;

    let ca_present = fs::path_exists(pki_dir.join(CA_CERT)).await?
        && fs::path_exists(pki_dir.join(CA_KEY)).await?;
    if !ca_present {
        info!("generating migration ca");
        generate_ca(pki_dir).await?;
    }
    for leaf in LEAVES {
        let cert = pki_dir.join(format!("{leaf}-cert.pem"));
        let key = pki_dir.join(format!("{leaf}-key.pem"));
        if !ca_present || !fs::path_exists(&cert).await? || !fs::path_exists(&key).await? {
            info!(leaf, "generating migration certificate");
            generate_leaf(pki_dir, leaf).await?;
        }
    }
    fs::remove_file_if_exists(pki_dir.join("ca-cert.srl")).await?;

    let mut certs = MigrateCerts::new();
    for name in CERT_FILES {
        let content = fs::read_file_to_string(pki_dir.join(name)).await?;
        certs.insert(name.to_owned(), content);
    }
    Ok(certs)
}

/// Installs a bundle produced by [`prepare_migrate_certs`] on another host.
#[tracing::instrument(skip_all, fields(pki_dir = %pki_dir.display()))]
pub async fn write_migrate_certs(pki_dir: &Path, certs: &MigrateCerts) -> Result<(), CertsError> {
    if let Some(name) = certs.keys().find(|name| !CERT_FILES.contains(&name.as_str())) {
        return Err(CertsError::UnknownFile(name.clone()));
    }
    if let Some(name) = CERT_FILES.iter().find(|name| !certs.contains_key(**name)) {
        return Err(CertsError::MissingFile(*name));
    }

    fs::create_dir(pki_dir).await?;
    for (name, content) in certs {
        let path: PathBuf = pki_dir.join(name);
        let mode = if is_key(name) { 0o600 } else { 0o644 };
        fs::write_file_with_mode(&path, content.as_bytes(), mode).await?;
    }
    info!(count = certs.len(), "installed migration certificates");
    Ok(())
}
