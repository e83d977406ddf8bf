mod common;
mod context_tests;
mod pipeline_tests;
