//! Host encoding model
//!
//! IBM i object names live in EBCDIC. Three "variant" characters (`#@$` in the
//! American code page) have different code points in localized CCSIDs, so every
//! name that crosses the SSH boundary must be mapped between the two alphabets.

pub mod ccsid;
pub mod path;
pub mod variants;

pub use ccsid::*;
pub use path::*;
pub use variants::*;
