#![doc = include_str!("../README.md")]

mod error;
mod sys;

pub mod addr;
pub mod line;
pub mod readiness;

pub use error::{Error, Result};
pub use line::{Callback, Family, Kind, Line};
pub use readiness::{readable, readable_any};
pub use sys::{RawSock, INVALID_SOCK};
