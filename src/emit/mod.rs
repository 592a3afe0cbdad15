pub mod run_result;
