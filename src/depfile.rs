//! Compiler-emitted dependency files.
//!
//! Two formats are understood: the classic gcc `.d` file and the JSON
//! emitted by MSVC's `/sourceDependencies`. Entries come back as written,
//! relative to the compiler's working directory; the caller anchors them.

use camino::Utf8Path;
use serde::Deserialize;

use crate::error::BuildError;

#[derive(Deserialize)]
struct MsvcDepfile {
    #[serde(rename = "Data")]
    data: MsvcData,
}

#[derive(Deserialize)]
struct MsvcData {
    #[serde(rename = "Includes")]
    includes: Vec<String>,
}

/// Parses depfile `text` according to `depformat` ("gcc" or "msvc").
pub fn parse(depformat: &str, path: &Utf8Path, text: &str) -> Result<Vec<String>, BuildError> {
    match depformat {
        "gcc" => Ok(parse_gcc(text)),
        "msvc" => parse_msvc(path, text),
        other => Err(BuildError::InvalidDepFormat(other.to_string())),
    }
}

/// `target: dep1 dep2 \` — whitespace-split, drop the leading target token
/// and any lone line-continuation backslash.
fn parse_gcc(text: &str) -> Vec<String> {
    text.split_whitespace()
        .skip(1)
        .filter(|token| *token != "\\")
        .map(str::to_string)
        .collect()
}

fn parse_msvc(path: &Utf8Path, text: &str) -> Result<Vec<String>, BuildError> {
    let depfile: MsvcDepfile = serde_json::from_str(text).map_err(|err| BuildError::Depfile {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok(depfile.data.includes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcc_drops_target_and_continuations() {
        let text = "out.o: hdr.h src.c \\\n  other.h more.h";
        let deps = parse("gcc", Utf8Path::new("out.d"), text).unwrap();
        assert_eq!(deps, ["hdr.h", "src.c", "other.h", "more.h"]);
    }

    #[test]
    fn gcc_handles_an_empty_dependency_list() {
        let deps = parse("gcc", Utf8Path::new("out.d"), "out.o:").unwrap();
        assert!(deps.is_empty());
    }

    #[test]
    fn msvc_reads_data_includes() {
        let text = r#"{"Data": {"Includes": ["a.h", "sub/b.h"], "Other": 1}}"#;
        let deps = parse("msvc", Utf8Path::new("out.d.json"), text).unwrap();
        assert_eq!(deps, ["a.h", "sub/b.h"]);
    }

    #[test]
    fn msvc_rejects_malformed_json() {
        let err = parse("msvc", Utf8Path::new("out.d.json"), "not json").unwrap_err();
        assert!(matches!(err, BuildError::Depfile { .. }));
    }

    #[test]
    fn unknown_formats_are_rejected() {
        let err = parse("clang-trace", Utf8Path::new("out.d"), "").unwrap_err();
        assert!(matches!(err, BuildError::InvalidDepFormat(f) if f == "clang-trace"));
    }
}
