fn main() {
    if let Err(err) = workspace_agent::cli::run_workspace_agent() {
        tracing::error!(error = %err, "workspace-agent failed");
        std::process::exit(1);
    }
}
