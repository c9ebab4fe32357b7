pub mod init;
pub mod launch;
pub mod status;
pub mod worker;
