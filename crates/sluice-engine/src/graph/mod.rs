//! Static pipeline graphs.
//!
//! A `GraphTemplate` is a set of `TemplateNode`s whose upstream lists define
//! the dependency edges. Templates are validated (acyclic, single root, join
//! wiring) before the scheduler instantiates them into a run.

pub mod edge;
pub mod node;
pub mod template;

pub use edge::Edge;
pub use node::TemplateNode;
pub use template::GraphTemplate;
