#![allow(dead_code)]

pub mod entities;
#[cfg(feature = "postgres")]
pub mod repositories;

#[allow(unused_imports)]
pub use entities::{ids, indices, lesson, lessons_under, seeded_lessons, Letters};
