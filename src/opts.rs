//! Link options. Full command-line handling belongs to the driver; this
//! module is the interface point that owns the option model and the
//! single-line diagnostic for unrecognized tokens.

use crate::{unknown_option_error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OutputKind {
    SharedObject,
    PositionIndependentExec,
    Exec,
}

impl OutputKind {
    /// Row index into the 3x4 scan-action tables.
    #[inline]
    pub(crate) fn row(self) -> usize {
        match self {
            OutputKind::SharedObject => 0,
            OutputKind::PositionIndependentExec => 1,
            OutputKind::Exec => 2,
        }
    }

    #[inline]
    pub fn is_shared(self) -> bool {
        self == OutputKind::SharedObject
    }

    #[inline]
    pub fn is_pic(self) -> bool {
        self != OutputKind::Exec
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HashStyle {
    Sysv,
    Gnu,
    /// The default: shared objects carry both `.hash` and `.gnu.hash`.
    Both,
}

#[derive(Clone, Debug)]
pub struct LinkOptions {
    pub output: Box<str>,
    pub output_kind: OutputKind,
    pub is_static: bool,
    pub gc_sections: bool,
    pub omagic: bool,
    pub script: Option<Box<str>>,
    pub export_dynamic: bool,
    pub as_needed: bool,
    pub hash_style: HashStyle,
    pub z_now: bool,
    pub z_relro: bool,
    pub objc: bool,
    pub emulation: Option<Box<str>>,
    pub allow_undefined: Vec<Box<str>>,
    pub library_paths: Vec<Box<str>>,
    pub libraries: Vec<Box<str>>,
    pub inputs: Vec<Box<str>>,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            output: "a.out".into(),
            output_kind: OutputKind::Exec,
            is_static: false,
            gc_sections: false,
            omagic: false,
            script: None,
            export_dynamic: false,
            as_needed: false,
            hash_style: HashStyle::Both,
            z_now: false,
            z_relro: true,
            objc: false,
            emulation: None,
            allow_undefined: Vec::new(),
            library_paths: Vec::new(),
            libraries: Vec::new(),
            inputs: Vec::new(),
        }
    }
}

impl LinkOptions {
    pub fn shared() -> Self {
        Self {
            output_kind: OutputKind::SharedObject,
            ..Self::default()
        }
    }

    pub fn pie() -> Self {
        Self {
            output_kind: OutputKind::PositionIndependentExec,
            ..Self::default()
        }
    }
}

fn parse_z_keyword(opts: &mut LinkOptions, token: &str, keyword: &str) -> Result<()> {
    match keyword {
        "now" => opts.z_now = true,
        "lazy" => opts.z_now = false,
        "relro" => opts.z_relro = true,
        "norelro" => opts.z_relro = false,
        "noexecstack" | "execstack" | "defs" | "nodelete" => {}
        _ => return Err(unknown_option_error(token)),
    }
    Ok(())
}

/// Validate a token stream into `LinkOptions`. Any unrecognized option is
/// fatal with the exact single-line message
/// `unknown command line option: <token>`, whatever the token's shape
/// (`-x`, `-z x`, `-abc`, `--abc`).
pub fn parse_args<'a, I>(args: I) -> Result<LinkOptions>
where
    I: IntoIterator<Item = &'a str>,
{
    let args: Vec<&str> = args.into_iter().collect();
    let mut opts = LinkOptions::default();
    let mut i = 0;

    let take_value = |i: &mut usize, flag: &str| -> Result<Box<str>> {
        *i += 1;
        match args.get(*i) {
            Some(v) => Ok((*v).into()),
            None => Err(unknown_option_error(flag)),
        }
    };

    while i < args.len() {
        let arg = args[i];
        match arg {
            "-shared" | "--shared" | "-Bshareable" => {
                opts.output_kind = OutputKind::SharedObject;
            }
            "-pie" | "--pie" | "--pic-executable" => {
                opts.output_kind = OutputKind::PositionIndependentExec;
            }
            "-no-pie" | "--no-pie" => opts.output_kind = OutputKind::Exec,
            "-static" | "--static" | "-Bstatic" => opts.is_static = true,
            "--gc-sections" => opts.gc_sections = true,
            "--no-gc-sections" => opts.gc_sections = false,
            "--omagic" | "-N" => opts.omagic = true,
            "--export-dynamic" | "-export_dynamic" | "-E" => opts.export_dynamic = true,
            "--no-export-dynamic" => opts.export_dynamic = false,
            "--as-needed" => opts.as_needed = true,
            "--no-as-needed" => opts.as_needed = false,
            "-ObjC" => opts.objc = true,
            "-T" | "--script" => opts.script = Some(take_value(&mut i, arg)?),
            "-o" => opts.output = take_value(&mut i, arg)?,
            "-m" => opts.emulation = Some(take_value(&mut i, arg)?),
            "-U" => {
                let sym = take_value(&mut i, arg)?;
                opts.allow_undefined.push(sym);
            }
            "-L" => {
                let dir = take_value(&mut i, arg)?;
                opts.library_paths.push(dir);
            }
            "-l" => {
                let lib = take_value(&mut i, arg)?;
                opts.libraries.push(lib);
            }
            "-z" => {
                i += 1;
                let Some(keyword) = args.get(i) else {
                    return Err(unknown_option_error("-z"));
                };
                // The detached form reports both words.
                let token = format!("-z {keyword}");
                parse_z_keyword(&mut opts, &token, keyword)?;
            }
            _ => {
                if let Some(style) = arg.strip_prefix("--hash-style=") {
                    opts.hash_style = match style {
                        "sysv" => HashStyle::Sysv,
                        "gnu" => HashStyle::Gnu,
                        "both" => HashStyle::Both,
                        _ => return Err(unknown_option_error(arg)),
                    };
                } else if let Some(path) = arg.strip_prefix("--script=") {
                    opts.script = Some(path.into());
                } else if let Some(keyword) = arg.strip_prefix("-z") {
                    parse_z_keyword(&mut opts, arg, keyword)?;
                } else if let Some(lib) = arg.strip_prefix("-l") {
                    opts.libraries.push(lib.into());
                } else if let Some(dir) = arg.strip_prefix("-L") {
                    opts.library_paths.push(dir.into());
                } else if arg.starts_with('-') {
                    return Err(unknown_option_error(arg));
                } else {
                    opts.inputs.push(arg.into());
                }
            }
        }
        i += 1;
    }
    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_flags() {
        let opts =
            parse_args(["-shared", "--gc-sections", "--as-needed", "a.o", "-lm"]).unwrap();
        assert_eq!(opts.output_kind, OutputKind::SharedObject);
        assert!(opts.gc_sections);
        assert!(opts.as_needed);
        assert_eq!(&*opts.inputs[0], "a.o");
        assert_eq!(&*opts.libraries[0], "m");
    }

    #[test]
    fn z_keywords() {
        let opts = parse_args(["-z", "now", "-znorelro"]).unwrap();
        assert!(opts.z_now);
        assert!(!opts.z_relro);
    }
}
