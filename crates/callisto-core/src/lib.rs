pub mod cache;
pub mod cfa;
pub mod consts;
pub mod error;
pub mod frame;
pub mod guard;
pub mod psf;
pub mod scan;
pub mod seqfile;
pub mod sequence;
pub mod source;
pub mod stats;
