mod element;
pub mod element_queue;
pub mod reader;
pub mod writer;

pub use element::ELEMENT_HEADER_LENGTH;
pub use element_queue::ElementQueue;
pub use reader::{ElementIter, ElementReader};
pub use writer::ElementWriter;
