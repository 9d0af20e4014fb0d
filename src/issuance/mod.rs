pub mod acme;
pub mod ca;
pub mod csr;
pub mod error;
pub mod key_authorization;
pub mod orchestrator;
pub mod retry;
pub mod validator;
