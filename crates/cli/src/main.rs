fn main() {
    dsid_utils::initialize_tracing();
    std::process::exit(dsid_lib::cli::run());
}
