// src/handlers/mod.rs

pub mod answers;
pub mod attempts;
pub mod exams;
pub mod ws;
