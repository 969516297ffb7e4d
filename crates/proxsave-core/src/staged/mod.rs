pub mod access;
pub mod atomic;
pub mod datastore;
pub mod notifications;
pub mod pbs_api;
pub mod sections;
