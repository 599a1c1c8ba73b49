//! Pooled connection manager multiplexing file operations over SSH/SFTP.

pub mod remote;
