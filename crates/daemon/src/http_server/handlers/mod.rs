pub mod ip;
pub mod landing;
pub mod measure;

pub use landing::not_found_handler;
