#![deny(dead_code)]
#![deny(unused_imports)]

pub mod clean;
pub mod config;
pub mod data;
pub mod transform;

#[path = "../fit/mod.rs"]
pub mod fit;

#[path = "../report/mod.rs"]
pub mod report;
