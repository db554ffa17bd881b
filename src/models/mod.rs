// src/models/mod.rs

pub mod answer;
pub mod checkpoint;
pub mod exam;
pub mod message;
pub mod question;
pub mod submission;
pub mod sync;
