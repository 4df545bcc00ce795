use miette::IntoDiagnostic;

fn main() -> miette::Result<()> {
    let (mut forth, command) = snapforth::with_cli_args().into_diagnostic()?;
    snapforth::run(&mut forth, command).into_diagnostic()
}
