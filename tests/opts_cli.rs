//! Option-shim contract: every unrecognized token, whatever its shape,
//! produces the exact single-line diagnostic.

mod common;

use parlink::{parse_args, Error, OutputKind};
use rstest::rstest;

#[rstest]
#[case(&["-zfoo"], "unknown command line option: -zfoo")]
#[case(&["-z", "x"], "unknown command line option: -z x")]
#[case(&["-x"], "unknown command line option: -x")]
#[case(&["-abc"], "unknown command line option: -abc")]
#[case(&["--abc"], "unknown command line option: --abc")]
#[case(&["--hash-style=fast"], "unknown command line option: --hash-style=fast")]
fn unknown_options_report_one_exact_line(#[case] args: &[&str], #[case] expected: &str) {
    let err = parse_args(args.iter().copied()).unwrap_err();
    assert!(matches!(err, Error::UnknownOption { .. }));
    assert_eq!(err.to_string(), expected);
}

#[test]
fn driver_flags_shape_the_link() {
    let opts = parse_args([
        "-shared",
        "--gc-sections",
        "--omagic",
        "-T",
        "link.ld",
        "--as-needed",
        "-export_dynamic",
        "-ObjC",
        "-U",
        "_sym",
        "-o",
        "liba.so",
        "main.o",
        "-lm",
    ])
    .unwrap();
    assert_eq!(opts.output_kind, OutputKind::SharedObject);
    assert!(opts.gc_sections);
    assert!(opts.omagic);
    assert_eq!(opts.script.as_deref(), Some("link.ld"));
    assert!(opts.as_needed);
    assert!(opts.export_dynamic);
    assert!(opts.objc);
    assert_eq!(&*opts.allow_undefined[0], "_sym");
    assert_eq!(&*opts.output, "liba.so");
    assert_eq!(&*opts.inputs[0], "main.o");
    assert_eq!(&*opts.libraries[0], "m");
}

#[test]
fn pie_and_static_are_recognized() {
    let opts = parse_args(["-pie", "-static", "--hash-style=gnu"]).unwrap();
    assert_eq!(opts.output_kind, OutputKind::PositionIndependentExec);
    assert!(opts.is_static);
}
