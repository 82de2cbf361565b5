//! sdt-package: data packages and the workflows that build, open and send them
//!
//! # Overview
//! - `encrypt`: files in, one signed and encrypted zip container out
//! - `decrypt`: container in, verified plaintext out
//! - `transfer`: batch re-verification and grouped upload
//! - `archive`, `container`, `naming`, `filesystem`: the pieces they share

pub mod archive;
pub mod container;
pub mod decrypt;
pub mod dtr;
pub mod encrypt;
pub mod filesystem;
pub mod naming;
pub mod session;
pub mod transfer;

pub use container::Container;
pub use decrypt::{decrypt, DecryptOptions, DecryptReport};
pub use encrypt::{encrypt, EncryptOptions, EncryptReport};
pub use naming::{check_package_name, generate_output_archive_name};
pub use session::Session;
pub use transfer::{
    group_by_recipients, transfer, verify_package, verify_packages, TransferOptions, TransferReport,
    VerifiedPackage,
};
