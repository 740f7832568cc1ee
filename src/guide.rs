//! Repository guide generation.
//!
//! Agents read `CLAUDE.md` at the repository root for conventions. When a
//! target repository has none, [`write_guide`] profiles it from manifest and
//! config files and writes one.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::{flog, Result};

pub const GUIDE_FILE: &str = "CLAUDE.md";

/// Only the head of each inspected file is read.
const MAX_READ_BYTES: u64 = 8 * 1024;
const MAX_SUMMARY_CHARS: usize = 300;

static MAKE_TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9_-]*)\s*:").unwrap());

const LANGUAGE_MARKERS: &[(&str, &str)] = &[
    ("package.json", "JavaScript/TypeScript"),
    ("requirements.txt", "Python"),
    ("pyproject.toml", "Python"),
    ("setup.py", "Python"),
    ("setup.cfg", "Python"),
    ("Cargo.toml", "Rust"),
    ("go.mod", "Go"),
    ("pom.xml", "Java"),
    ("build.gradle", "Java/Kotlin"),
    ("Gemfile", "Ruby"),
    ("composer.json", "PHP"),
];

/// Languages recognised by file extension at the top level.
const LANGUAGE_EXTENSIONS: &[(&str, &str)] = &[("gemspec", "Ruby"), ("csproj", "C#")];

const JS_FRAMEWORKS: &[(&str, &str)] = &[
    ("react", "React"),
    ("vue", "Vue.js"),
    ("next", "Next.js"),
    ("@angular/core", "Angular"),
    ("express", "Express"),
    ("fastify", "Fastify"),
    ("svelte", "Svelte"),
    ("nuxt", "Nuxt.js"),
];

const PY_FRAMEWORKS: &[(&str, &str)] = &[
    ("django", "Django"),
    ("flask", "Flask"),
    ("fastapi", "FastAPI"),
    ("tornado", "Tornado"),
    ("starlette", "Starlette"),
];

const LINTER_FILES: &[(&str, &str)] = &[
    (".eslintrc", "ESLint"),
    (".eslintrc.js", "ESLint"),
    (".eslintrc.json", "ESLint"),
    (".eslintrc.yml", "ESLint"),
    ("eslint.config.js", "ESLint"),
    ("eslint.config.mjs", "ESLint"),
    (".flake8", "Flake8"),
    ("ruff.toml", "Ruff"),
    (".ruff.toml", "Ruff"),
    (".pylintrc", "Pylint"),
    ("mypy.ini", "mypy"),
    (".prettierrc", "Prettier"),
    (".prettierrc.json", "Prettier"),
    ("prettier.config.js", "Prettier"),
    ("clippy.toml", "Clippy"),
    ("rustfmt.toml", "rustfmt"),
];

const PYPROJECT_LINTERS: &[(&str, &str)] = &[
    ("[tool.ruff", "Ruff"),
    ("[tool.mypy", "mypy"),
    ("[tool.pylint", "Pylint"),
];

const NOTABLE_DIRS: &[&str] = &[
    "src", "lib", "tests", "test", "spec", "docs", "scripts", "config", "pkg", "cmd",
    "internal", "public", "static", "assets", "components", "pages", "api", "models", "utils",
    "migrations", "fixtures",
];

const NOTABLE_FILES: &[&str] = &[
    "README.md",
    "PLAN.yaml",
    "Makefile",
    "docker-compose.yml",
    "Dockerfile",
    ".env.example",
];

#[derive(Debug, Default, Deserialize)]
struct PackageJson {
    #[serde(default)]
    dependencies: HashMap<String, serde_json::Value>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: HashMap<String, serde_json::Value>,
    #[serde(default)]
    scripts: HashMap<String, String>,
}

impl PackageJson {
    fn has_dep(&self, needle: impl Fn(&str) -> bool) -> bool {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .any(|k| needle(k))
    }
}

/// Head of a file as lossy UTF-8; empty when unreadable.
fn read_head(path: &Path) -> String {
    let Ok(file) = std::fs::File::open(path) else {
        return String::new();
    };
    let mut buf = Vec::new();
    if file.take(MAX_READ_BYTES).read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn package_json(repo: &Path) -> Option<PackageJson> {
    let text = std::fs::read_to_string(repo.join("package.json")).ok()?;
    serde_json::from_str(&text).ok()
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|x| x == item) {
        list.push(item.to_string());
    }
}

/// What a repository is built with, as far as its top-level files tell.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RepoProfile {
    pub name: String,
    pub summary: Option<String>,
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    pub test_framework: Option<String>,
    /// `(tool, config file)` pairs.
    pub linters: Vec<(String, String)>,
    pub commands: Vec<String>,
    pub notable: Vec<String>,
}

impl RepoProfile {
    pub fn detect(repo: &Path) -> Self {
        let package = package_json(repo);
        Self {
            name: repo
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            summary: readme_summary(repo),
            languages: detect_languages(repo),
            frameworks: detect_frameworks(repo, package.as_ref()),
            test_framework: detect_test_framework(repo, package.as_ref()),
            linters: detect_linters(repo),
            commands: detect_commands(repo, package.as_ref()),
            notable: detect_notable(repo),
        }
    }

    /// Markdown guide content.
    pub fn render(&self) -> String {
        let mut out = String::from("# Project Overview\n\n");
        match &self.summary {
            Some(summary) => out.push_str(summary),
            None => out.push_str(&format!("Repository at `{}`.", self.name)),
        }
        out.push_str("\n\n## Tech Stack\n\n");
        if !self.languages.is_empty() {
            out.push_str(&format!("**Languages:** {}\n", self.languages.join(", ")));
        }
        if !self.frameworks.is_empty() {
            out.push_str(&format!("**Frameworks:** {}\n", self.frameworks.join(", ")));
        }
        if let Some(test) = &self.test_framework {
            out.push_str(&format!("**Test framework:** {}\n", test));
        }
        if !self.linters.is_empty() {
            let tools: Vec<&str> = self.linters.iter().map(|(t, _)| t.as_str()).collect();
            out.push_str(&format!("**Linters/formatters:** {}\n", tools.join(", ")));
        }
        if self.languages.is_empty() && self.frameworks.is_empty() {
            out.push_str("_(Could not auto-detect tech stack)_\n");
        }

        if !self.notable.is_empty() {
            out.push_str("\n## Directory Structure\n\nNotable directories and files:\n");
            for entry in &self.notable {
                out.push_str(&format!("- `{}`\n", entry));
            }
        }

        if !self.linters.is_empty() {
            out.push_str("\n## Code Conventions\n\n");
            for (tool, config) in &self.linters {
                out.push_str(&format!("- **{}**: configured in `{}`\n", tool, config));
            }
        }

        out.push_str("\n## Test Conventions\n\n");
        match self.test_framework.as_deref() {
            Some(test) => {
                out.push_str(&format!("- **Framework:** {}\n", test));
                out.push_str(test_hint(test));
            }
            None => out.push_str("_(No test framework detected)_\n"),
        }

        if !self.commands.is_empty() {
            out.push_str("\n## Build / Run Commands\n\n");
            for command in &self.commands {
                out.push_str(&format!("```\n{}\n```\n", command));
            }
        }
        out
    }
}

fn test_hint(framework: &str) -> &'static str {
    match framework {
        "pytest" => "- Test files follow `test_*.py` naming\n- Run: `pytest`\n",
        "Jest" | "Mocha" | "Vitest" => "- Run: `npm test`\n",
        "cargo test" => "- Unit tests sit beside the code; integration tests in `tests/`\n- Run: `cargo test`\n",
        "go test" => "- Test files follow `*_test.go` naming\n- Run: `go test ./...`\n",
        _ => "",
    }
}

fn detect_languages(repo: &Path) -> Vec<String> {
    let mut languages = Vec::new();
    for (marker, language) in LANGUAGE_MARKERS {
        if repo.join(marker).exists() {
            push_unique(&mut languages, language);
        }
    }
    if let Ok(entries) = std::fs::read_dir(repo) {
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if let Some((_, language)) = LANGUAGE_EXTENSIONS.iter().find(|(e, _)| *e == ext) {
                push_unique(&mut languages, language);
            }
        }
    }
    languages
}

fn requirement_names(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| {
            l.trim()
                .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
                .next()
                .unwrap_or("")
                .to_lowercase()
        })
        .filter(|name| !name.is_empty())
        .collect()
}

fn detect_frameworks(repo: &Path, package: Option<&PackageJson>) -> Vec<String> {
    let mut frameworks = Vec::new();
    if let Some(package) = package {
        for (dep, name) in JS_FRAMEWORKS {
            if package.has_dep(|k| k == *dep) {
                push_unique(&mut frameworks, name);
            }
        }
    }
    for file in ["requirements.txt", "requirements-dev.txt"] {
        let names = requirement_names(&read_head(&repo.join(file)));
        for (dep, name) in PY_FRAMEWORKS {
            if names.iter().any(|n| n == dep) {
                push_unique(&mut frameworks, name);
            }
        }
    }
    let pyproject = read_head(&repo.join("pyproject.toml")).to_lowercase();
    for (dep, name) in &PY_FRAMEWORKS[..3] {
        if pyproject.contains(dep) {
            push_unique(&mut frameworks, name);
        }
    }
    frameworks
}

fn detect_test_framework(repo: &Path, package: Option<&PackageJson>) -> Option<String> {
    let python_configs = ["pytest.ini", "pyproject.toml", "setup.cfg", "tox.ini", "requirements.txt"];
    if python_configs
        .iter()
        .any(|f| read_head(&repo.join(f)).to_lowercase().contains("pytest"))
    {
        return Some("pytest".to_string());
    }
    if let Some(package) = package {
        let test_script = package
            .scripts
            .get("test")
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        for (needle, name) in [("jest", "Jest"), ("mocha", "Mocha"), ("vitest", "Vitest")] {
            if package.has_dep(|k| k.contains(needle)) || test_script.contains(needle) {
                return Some(name.to_string());
            }
        }
    }
    if repo.join("Cargo.toml").exists() {
        return Some("cargo test".to_string());
    }
    if repo.join("go.mod").exists() {
        return Some("go test".to_string());
    }
    None
}

fn detect_linters(repo: &Path) -> Vec<(String, String)> {
    let mut linters: Vec<(String, String)> = Vec::new();
    let mut add = |tool: &str, config: &str| {
        if !linters.iter().any(|(t, _)| t == tool) {
            linters.push((tool.to_string(), config.to_string()));
        }
    };
    for (file, tool) in LINTER_FILES {
        if repo.join(file).exists() {
            add(tool, file);
        }
    }
    let pyproject = read_head(&repo.join("pyproject.toml"));
    for (section, tool) in PYPROJECT_LINTERS {
        if pyproject.contains(section) {
            add(tool, "pyproject.toml");
        }
    }
    linters
}

fn make_targets(makefile: &str) -> Vec<String> {
    makefile
        .lines()
        .filter(|l| !l.starts_with('\t') && !l.starts_with('#') && !l.contains(":="))
        .filter_map(|l| MAKE_TARGET_RE.captures(l).map(|c| c[1].to_string()))
        .take(8)
        .collect()
}

fn detect_commands(repo: &Path, package: Option<&PackageJson>) -> Vec<String> {
    let mut commands = Vec::new();
    if let Some(package) = package {
        for script in ["build", "start", "dev", "test", "lint"] {
            if package.scripts.contains_key(script) {
                commands.push(format!("npm run {}", script));
            }
        }
    }
    if repo.join("requirements.txt").exists() {
        commands.push("pip install -r requirements.txt".to_string());
    }
    let pyproject = read_head(&repo.join("pyproject.toml")).to_lowercase();
    if pyproject.contains("pytest") {
        commands.push("pytest".to_string());
    }
    if pyproject.contains("ruff") {
        commands.push("ruff check .".to_string());
    }
    let targets = make_targets(&read_head(&repo.join("Makefile")));
    if !targets.is_empty() {
        commands.push(format!("make  # targets: {}", targets.join(", ")));
    }
    if repo.join("Cargo.toml").exists() {
        commands.extend(["cargo build", "cargo test", "cargo run"].map(String::from));
    }
    if repo.join("go.mod").exists() {
        commands.extend(["go build ./...", "go test ./..."].map(String::from));
    }
    commands
}

fn detect_notable(repo: &Path) -> Vec<String> {
    let dirs = NOTABLE_DIRS
        .iter()
        .filter(|d| repo.join(d).is_dir())
        .map(|d| format!("{}/", d));
    let files = NOTABLE_FILES
        .iter()
        .filter(|f| repo.join(f).is_file())
        .map(|f| f.to_string());
    dirs.chain(files).collect()
}

/// First paragraph of the README. A leading heading becomes the title line
/// followed by up to five body lines; plain prose is cut near
/// [`MAX_SUMMARY_CHARS`].
fn readme_summary(repo: &Path) -> Option<String> {
    let text = ["README.md", "README.rst", "README.txt", "README"]
        .iter()
        .map(|name| repo.join(name))
        .find(|p| p.is_file())
        .map(|p| read_head(&p))?;
    let paragraph = text.split("\n\n").map(str::trim).find(|p| !p.is_empty())?;

    if paragraph.starts_with('#') {
        let mut lines = paragraph.lines();
        let title = lines.next().unwrap_or("").trim_start_matches('#').trim();
        let body: Vec<&str> = lines.filter(|l| !l.trim().is_empty()).take(5).collect();
        return Some(if body.is_empty() {
            title.to_string()
        } else {
            format!("{}\n\n{}", title, body.join("\n"))
        });
    }
    if paragraph.chars().count() <= MAX_SUMMARY_CHARS {
        return Some(paragraph.to_string());
    }
    let cut: String = paragraph.chars().take(MAX_SUMMARY_CHARS).collect();
    let cut = cut.rsplit_once(' ').map(|(head, _)| head).unwrap_or(&cut);
    Some(format!("{}...", cut))
}

/// Write a generated guide into `repo` unless one exists (or `force`).
///
/// Returns whether the file was written.
pub fn write_guide(repo: &Path, force: bool) -> Result<bool> {
    let target = repo.join(GUIDE_FILE);
    if target.exists() && !force {
        flog!("{} already exists at {}; leaving it", GUIDE_FILE, target.display());
        return Ok(false);
    }
    let content = RepoProfile::detect(repo).render();
    std::fs::write(&target, &content)?;
    flog!("Wrote {} ({} bytes)", target.display(), content.len());
    Ok(true)
}
