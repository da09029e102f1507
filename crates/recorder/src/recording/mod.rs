pub mod controller;
pub mod pipeline;
pub mod sink;
