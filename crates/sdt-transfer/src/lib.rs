//! sdt-transfer: delivery of finished packages
//!
//! The workflows only see [`TransferProtocol`]; concrete protocols are
//! backed by OpenDAL operators.

pub mod operator;
pub mod protocol;

pub use operator::{build_fs_operator, build_s3_operator, upload_files, S3Settings};
pub use protocol::{protocol_from_config, LocalProtocol, S3Protocol, TransferProtocol, TwoFactor};
