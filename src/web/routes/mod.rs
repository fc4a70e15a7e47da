// Route handler modules

pub mod export;
pub mod generate;
pub mod health;
pub mod index;
pub mod model;
pub mod static_files;
pub mod status;
