fn main() -> std::process::ExitCode {
    match nabha_lib::run() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("nabha: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}
