//! stitcher-ingestion: Source-facing half of the stitching core.
//! - Streaming record extraction from multi-gigabyte XML dumps
//! - Input helpers (gzip, SHA-1 digesting reader)
//! - Identity key resolution and cross-reference cleanup rules
//! - Entity registration and data source bookkeeping
//! - Two-phase batch driver for out-of-order references

pub mod xml_stream;
pub mod xml_record;
pub mod digest;
pub mod normalise;
pub mod registrar;
pub mod datasource;
pub mod pipeline;

pub use datasource::{Completion, DataSourceRegistry, SourceHandle};
pub use digest::{open_input, DigestReader, InputReader};
pub use normalise::{KeyBinding, KeyMapper, KeyResolver, RuleAction, RuleSet};
pub use pipeline::{BatchReport, PendingLink, PhaseOne, PhaseTwo, TwoPhaseBatch};
pub use registrar::{Registrar, Registration};
pub use xml_record::{parse_fragment, XmlElement};
pub use xml_stream::{StreamControl, XmlStream};
