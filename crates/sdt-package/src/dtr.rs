//! Data Transfer Request checks against the portal.

use sdt_core::portal::PortalApi;
use sdt_core::{MetaData, Purpose, SdtError, SdtResult};
use tracing::info;

const ERROR_PREFIX: &str = "Cannot verify DTR (Data Transfer Request) ID";

fn portal<'a>(portal: Option<&'a dyn PortalApi>) -> SdtResult<&'a dyn PortalApi> {
    portal.ok_or_else(|| SdtError::user(format!("{ERROR_PREFIX}: no portal URL specified in config.")))
}

/// Encrypt-time check: the DTR must cover this sender, these recipients and
/// this purpose. Returns the project code.
pub fn verify_dtr_info(
    portal_api: Option<&dyn PortalApi>,
    transfer_id: Option<u64>,
    purpose: Option<Purpose>,
    sender: &str,
    recipients: &[String],
) -> SdtResult<String> {
    let transfer_id =
        transfer_id.ok_or_else(|| SdtError::user(format!("{ERROR_PREFIX}: 'DTR ID' is missing.")))?;
    let purpose = purpose.ok_or_else(|| SdtError::user(format!("{ERROR_PREFIX}: 'purpose' is missing.")))?;
    let portal_api = portal(portal_api)?;

    // The package checksum is not known yet.
    let metadata = MetaData::new(
        Some(transfer_id),
        sender,
        recipients.to_vec(),
        Some(purpose),
        "0".repeat(64),
        "",
    )?;
    let project_code = portal_api
        .verify_dpkg_metadata(&metadata, "missing")
        .map_err(|e| SdtError::service(format!("{ERROR_PREFIX} {transfer_id}"), e))?;
    info!(transfer_id, project_code = %project_code, "DTR verified");
    Ok(project_code)
}

/// Transfer-time check of a finished package's metadata.
pub fn verify_package_dtr(
    portal_api: Option<&dyn PortalApi>,
    metadata: &MetaData,
    file_name: &str,
) -> SdtResult<String> {
    let transfer_id = metadata.transfer_id.ok_or_else(|| {
        SdtError::user(format!("{ERROR_PREFIX}: package '{file_name}' has no transfer_id in its metadata."))
    })?;
    portal(portal_api)?
        .verify_dpkg_metadata(metadata, file_name)
        .map_err(|e| SdtError::service(format!("{ERROR_PREFIX} {transfer_id}"), e))
}
