pub mod batch_cache;
pub mod encoder;
pub mod engine;
pub mod filters;
pub mod frame_batch;
pub mod frame_order;
pub mod frame_writer;
pub mod normalization;
pub mod sampler;
pub mod video_assembler;
pub mod volume_spec;
