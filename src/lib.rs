//! EMR OAuth2 session broker and FHIR patient gateway.
//!
//! Clinic users connect their accounts at external record systems through the
//! SMART authorization-code flow; patient lookups and registrations then run
//! against each system's FHIR R4 API on the user's behalf.

pub mod activity_log;
pub mod config;
pub mod emr;
pub mod server;
