//! Logging: a dedicated logger thread writing to a rotating file and the console.

pub mod dual;
pub mod record;
pub mod rotating;
