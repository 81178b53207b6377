mod api_runs;
mod engine_runs;
mod locks;
