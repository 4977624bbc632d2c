pub mod approval_form;
pub mod calendar;
pub mod command;
pub mod crypto;
pub mod report;

pub use approval_form::{class_from_label, extract_renewal_form, parse_approval_detail, RenewalForm};
pub use calendar::{remaining_days, renewal_end, ExpiryStatus};
pub use command::{normalize_plate, parse_command, Command, CommandError};
pub use crypto::{signature, verify_signature, CryptoError, MsgCrypt};

/// Marker written into ticket and fee-record remarks for approval-driven renewals.
pub fn approval_marker(sp_no: &str) -> String {
    format!("审批单号:{sp_no}")
}
