//! Generates one `#[test]` per flow graph filetest.
//!
//! Each subdirectory of `tests` becomes a module, and each file in it a
//! test case named after the file stem. The first lines of a filetest
//! hold directives; `// @harness <name>` is mandatory and names the
//! function in `harnesses` (in `tests/main.rs`) that drives the case.
//! A sibling file with the suffix `.expected` is passed to the harness
//! as the expected output, usually a formatted flow graph.

use quote::{format_ident, quote};
use std::{env, error::Error, fs, path::Path};

const HARNESS_DIRECTIVE: &str = "// @harness";

fn harness_name(path: &Path, contents: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
    let line = contents
        .lines()
        .find_map(|line| line.trim().strip_prefix(HARNESS_DIRECTIVE))
        .ok_or_else(|| format!("{} has no {HARNESS_DIRECTIVE} directive", path.display()))?;
    Ok(line.trim().to_owned())
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    println!("cargo:rerun-if-changed=tests");

    let mut modules = Vec::new();
    let mut dirs: Vec<_> = fs::read_dir("tests")?.collect::<Result<_, _>>()?;
    dirs.sort_by_key(|entry| entry.file_name());

    for dir in dirs {
        if !dir.file_type()?.is_dir() {
            continue;
        }
        let module_name = format_ident!("{}", dir.file_name().to_string_lossy());

        let mut files: Vec<_> = fs::read_dir(dir.path())?.collect::<Result<_, _>>()?;
        files.sort_by_key(|entry| entry.file_name());

        let mut tests = Vec::new();
        for file in files {
            let file_name = file.file_name().to_string_lossy().into_owned();
            if file_name.ends_with(".expected") {
                continue;
            }
            let stem = file_name.split('.').next().unwrap_or(&file_name);
            let test_name = format_ident!("test_{stem}");

            let contents = fs::read_to_string(file.path())?;
            let harness = format_ident!("{}", harness_name(&file.path(), &contents)?);

            let expected_path = file.path().with_file_name(format!("{file_name}.expected"));
            let expected = if expected_path.exists() {
                let expected = fs::read_to_string(expected_path)?;
                quote! { , #expected }
            } else {
                quote! {}
            };

            tests.push(quote! {
                #[test]
                fn #test_name() {
                    super::harnesses::#harness(#contents #expected);
                }
            });
        }

        modules.push(quote! {
            mod #module_name {
                #(#tests)*
            }
        });
    }

    let code = quote! { #(#modules)* };
    let out_path = Path::new(&env::var("OUT_DIR")?).join("generated.rs");
    fs::write(out_path, code.to_string())?;
    Ok(())
}
