pub mod apdu;
pub mod error;
pub mod polling;
pub mod reader;
pub mod response;
pub mod utils;
