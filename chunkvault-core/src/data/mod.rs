//! Row/frame data model and the chunk file codec.

pub mod codec;
pub mod frame;
pub mod row;

pub use codec::{decode, encode, CodecError, DATE_COLUMN, DATE_FORMAT};
pub use frame::Frame;
pub use row::{FieldValue, Row};
