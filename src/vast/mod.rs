pub mod elements;
pub mod macros;
pub mod parser;
pub mod protocol;

pub use elements::VastVersion;
pub use macros::{MacroContext, MacroRegistry};
pub use parser::{VastDocument, VastKind, VastParser};
pub use protocol::VastProtocol;
