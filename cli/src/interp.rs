use std::{collections::HashMap, path::Path};

pub type Result = std::result::Result<String, InterpError>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum InterpError {
    #[error("undefined placeholder '{{{0}}}' in command template")]
    UndefinedVar(String),

    #[error("unclosed '{{' in command template")]
    UnclosedBrace,
}

/// Expands `{name}` placeholders; `{{` and `}}` are literal braces.
pub fn expand(template: &str, vars: &HashMap<&str, String>) -> Result {
    let mut res = String::with_capacity(template.len() + 16);
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                res.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                res.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(InterpError::UnclosedBrace),
                    }
                }
                let Some(value) = vars.get(name.as_str()) else {
                    return Err(InterpError::UndefinedVar(name));
                };
                res.push_str(value);
            }
            _ => res.push(c),
        }
    }
    Ok(res)
}

/// Placeholders derived from the program file path: `{file}`, `{name}`,
/// `{stem}`, `{ext}`, `{dir}`.
pub fn program_file_vars(program_file: &Path) -> HashMap<&'static str, String> {
    let mut vars = HashMap::new();
    vars.insert("file", program_file.display().to_string());
    vars.insert(
        "name",
        program_file
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    vars.insert(
        "stem",
        program_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    vars.insert(
        "ext",
        program_file
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    vars.insert(
        "dir",
        program_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .display()
            .to_string(),
    );
    vars
}

#[cfg(test)]
mod test {
    use super::*;

    fn vars() -> HashMap<&'static str, String> {
        let mut m = HashMap::new();
        m.insert("file", "a/main.cpp".to_owned());
        m.insert("stem", "main".to_owned());
        m
    }

    #[test]
    fn expand_ok() {
        let vars = vars();
        assert_eq!(expand("hello", &vars).unwrap(), "hello");
        assert_eq!(expand("{file}", &vars).unwrap(), "a/main.cpp");
        assert_eq!(
            expand("g++ -o {stem} {file}", &vars).unwrap(),
            "g++ -o main a/main.cpp"
        );
        assert_eq!(expand("{stem}{stem}", &vars).unwrap(), "mainmain");
        assert_eq!(expand("a {{b}} c", &vars).unwrap(), "a {b} c");
        assert_eq!(expand("{{{file}}}", &vars).unwrap(), "{a/main.cpp}");
    }

    #[test]
    fn expand_ng() {
        let vars = vars();
        assert_eq!(
            expand("{nope}", &vars).unwrap_err(),
            InterpError::UndefinedVar("nope".to_owned())
        );
        assert_eq!(
            expand("echo {file", &vars).unwrap_err(),
            InterpError::UnclosedBrace
        );
    }

    #[test]
    fn vars_from_program_file() {
        let vars = program_file_vars(Path::new("work/main.cpp"));
        assert_eq!(vars["file"], "work/main.cpp");
        assert_eq!(vars["name"], "main.cpp");
        assert_eq!(vars["stem"], "main");
        assert_eq!(vars["ext"], "cpp");
        assert_eq!(vars["dir"], "work");

        let vars = program_file_vars(Path::new("main.cpp"));
        assert_eq!(vars["dir"], ".");
    }
}
