//! Job recording and job-local resource allocation (spec §4: C1-C7).

pub mod aliasing;
pub mod descriptor;
pub mod local_buffer;
pub mod local_image;
pub mod preinit;
pub mod record;
pub mod resource_pool;

pub use record::Job;
