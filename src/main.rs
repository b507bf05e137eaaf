fn main() {
    if let Err(err) = bootmend::cli::run() {
        bootmend::ui::eprintln_error(&err);
        std::process::exit(bootmend::exit::exit_code(&err));
    }
}
