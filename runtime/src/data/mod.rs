//! Data plumbing between the transport layer and routines.

pub mod notifier;
pub mod visitor;

pub use notifier::{DataNotifier, Notifier};
pub use visitor::{
    ChannelBuffer, DataVisitor, DataVisitor1, DataVisitor2, DataVisitor3, DataVisitor4,
    DataVisitorBase,
};
