//! Generic implementations shared by every backend

pub mod quantization;
