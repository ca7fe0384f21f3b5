pub mod ir;
pub mod logging;
pub mod samples;
