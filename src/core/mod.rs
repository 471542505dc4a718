pub mod algorithm;
pub mod builder;
pub mod catalog;
pub mod descriptor;
pub mod extract;
pub mod fusion;
pub mod hash;
pub mod matcher;
pub mod npy;
pub mod pipeline;
pub mod search;
pub mod types;
