pub mod analysis;
pub mod classes;
pub mod core;
pub mod grades;
pub mod staff;
pub mod students;
pub mod subjects;
