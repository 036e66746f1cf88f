use classpatch::patch::{ClassEditor, Error};

use clap::{crate_version, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

fn main() -> Result<(), Error> {
    env_logger::init();

    let matches = cli().get_matches();

    let input = match matches.get_one::<PathBuf>("INPUT") {
        Some(input) => input,
        None => return Ok(()),
    };
    log::info!("Reading '{}'", input.display());
    let mut editor = ClassEditor::load(input)?;

    if matches.get_flag("list") {
        for (name, descriptor) in editor.methods()? {
            println!("{}:{}", name, descriptor);
        }
        return Ok(());
    }

    if let Some(method) = matches.get_one::<String>("method") {
        patch_method(&mut editor, method, &matches)?;
    }

    let output = matches.get_one::<PathBuf>("output").unwrap_or(input);
    editor.save_to_path(output)?;
    Ok(())
}

/// Apply the edits requested on the command line, in a fixed order
fn patch_method(editor: &mut ClassEditor, method: &str, matches: &ArgMatches) -> Result<(), Error> {
    let (name, descriptor) = match (method.split_once(':'), method.find('(')) {
        (Some((name, descriptor)), _) => (name, Some(descriptor)),
        (None, Some(idx)) => (&method[..idx], Some(&method[idx..])),
        (None, None) => (method, None),
    };
    let mut behavior = editor.method(name, descriptor)?;
    let snippet = |id: &str| matches.get_one::<String>(id).map(String::as_str);

    if let Some(body) = snippet("body") {
        log::info!("Replacing the body of '{}'", method);
        behavior.set_body(body)?;
    }
    if let Some(before) = snippet("before") {
        log::info!("Inserting code before '{}'", method);
        behavior.insert_before(before)?;
    }
    if let Some(after) = snippet("after") {
        let as_finally = matches.get_flag("finally");
        log::info!("Inserting code after '{}'", method);
        behavior.insert_after(after, as_finally)?;
    }
    if let (Some(handler), Some(exception_type)) = (snippet("catch"), snippet("catch-type")) {
        let name = snippet("catch-name").unwrap_or("$e");
        log::info!("Catching '{}' in '{}'", exception_type, method);
        behavior.add_catch(handler, exception_type, name)?;
    }
    Ok(())
}

fn cli() -> Command {
    Command::new("Class file patcher")
        .version(crate_version!())
        .about("Splice bytecode snippets into the methods of compiled JVM classes")
        .arg(
            Arg::new("INPUT")
                .help("Class file to patch")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .index(1),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Where to write the patched class (defaults to overwriting the input)"),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .action(ArgAction::SetTrue)
                .help("Print the methods of the class and exit"),
        )
        .arg(
            Arg::new("method")
                .long("method")
                .short('m')
                .value_name("NAME[:DESCRIPTOR]")
                .required_unless_present("list")
                .help("Method to patch (eg. `run` or `<init>:(I)V`)"),
        )
        .arg(
            Arg::new("body")
                .long("body")
                .value_name("SNIPPET")
                .help("Replace the method body"),
        )
        .arg(
            Arg::new("before")
                .long("before")
                .value_name("SNIPPET")
                .help("Insert code at the start of the method"),
        )
        .arg(
            Arg::new("after")
                .long("after")
                .value_name("SNIPPET")
                .help("Insert code before every return"),
        )
        .arg(
            Arg::new("finally")
                .long("finally")
                .action(ArgAction::SetTrue)
                .requires("after")
                .help("Also run the `--after` code when the method throws"),
        )
        .arg(
            Arg::new("catch")
                .long("catch")
                .value_name("SNIPPET")
                .requires("catch-type")
                .help("Add a handler around the whole method (must return or throw)"),
        )
        .arg(
            Arg::new("catch-type")
                .long("catch-type")
                .value_name("CLASS_NAME")
                .requires("catch")
                .help("Exception class caught by `--catch` (eg. `java.io.IOException`)"),
        )
        .arg(
            Arg::new("catch-name")
                .long("catch-name")
                .value_name("NAME")
                .default_value("$e")
                .help("Variable holding the exception in the `--catch` code"),
        )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn unpaired_options_are_rejected() {
        let parse = |args: &[&str]| {
            let mut argv = vec!["classpatch", "Foo.class", "--method", "run"];
            argv.extend_from_slice(args);
            cli().try_get_matches_from(argv)
        };
        assert!(parse(&["--after", "nop", "--finally"]).is_ok());
        assert!(parse(&["--finally"]).is_err());
        assert!(parse(&["--catch", "athrow"]).is_err());
        assert!(parse(&["--catch-type", "java.io.IOException"]).is_err());
        assert!(parse(&["--catch", "athrow", "--catch-type", "java.io.IOException"]).is_ok());
        assert!(cli().try_get_matches_from(["classpatch", "Foo.class"]).is_err());
        assert!(cli()
            .try_get_matches_from(["classpatch", "Foo.class", "--list"])
            .is_ok());
    }
}
