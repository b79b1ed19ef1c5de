pub mod header;
pub mod isoch;
pub mod pipeline;
pub mod sample;
pub mod sim;
pub mod transfer;
