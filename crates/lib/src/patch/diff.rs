//! Unified diff parsing and exact application.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Line {
  Context(String),
  Remove(String),
  Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hunk {
  pub old_start: usize,
  pub old_len: usize,
  pub new_len: usize,
  pub lines: Vec<Line>,
  /// `\ No newline at end of file` followed the last new-side line.
  pub new_missing_newline: bool,
}

/// Changes to one file. `None` paths stand for `/dev/null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FilePatch {
  pub old_path: Option<String>,
  pub new_path: Option<String>,
  pub hunks: Vec<Hunk>,
}

impl FilePatch {
  /// The path the patch operates on.
  pub fn target(&self) -> Option<&str> {
    self.new_path.as_deref().or(self.old_path.as_deref())
  }

  pub fn creates(&self) -> bool {
    self.old_path.is_none()
  }

  pub fn deletes(&self) -> bool {
    self.new_path.is_none()
  }
}

/// Parse every file section of a unified diff.
///
/// Text before the first `---` header (commit messages, `diff --git` and
/// `index` lines) is ignored. Lines are split on `\n` only, the same way
/// [`Text::parse`] splits file content, so a `\r` stays part of the line.
pub(crate) fn parse(diff: &str) -> Result<Vec<FilePatch>, String> {
  let body = diff.strip_suffix('\n').unwrap_or(diff);
  let lines: Vec<&str> = body.split('\n').collect();
  let mut files = Vec::new();
  let mut i = 0;

  while i < lines.len() {
    let Some(old) = lines[i].strip_prefix("--- ") else {
      i += 1;
      continue;
    };
    let new = lines
      .get(i + 1)
      .and_then(|l| l.strip_prefix("+++ "))
      .ok_or_else(|| format!("line {}: '---' header without '+++'", i + 1))?;
    i += 2;

    let mut file = FilePatch {
      old_path: header_path(old),
      new_path: header_path(new),
      hunks: Vec::new(),
    };
    if file.old_path.is_none() && file.new_path.is_none() {
      return Err(format!("line {}: both sides are /dev/null", i - 1));
    }

    while i < lines.len() && lines[i].starts_with("@@") {
      let (hunk, next) = parse_hunk(&lines, i)?;
      file.hunks.push(hunk);
      i = next;
    }

    if file.hunks.is_empty() {
      return Err(format!("no hunks for {}", file.target().unwrap_or("?")));
    }
    files.push(file);
  }

  if files.is_empty() {
    return Err("no file sections found".to_string());
  }
  Ok(files)
}

fn header_path(raw: &str) -> Option<String> {
  let path = raw.split('\t').next().unwrap_or(raw).trim_end();
  if path == "/dev/null" {
    return None;
  }
  let stripped = path
    .strip_prefix("a/")
    .or_else(|| path.strip_prefix("b/"))
    .unwrap_or(path);
  Some(stripped.to_string())
}

fn parse_range(range: &str) -> Result<(usize, usize), String> {
  let (start, len) = match range.split_once(',') {
    Some((s, l)) => (s, l),
    None => (range, "1"),
  };
  let start = start.parse().map_err(|_| format!("bad range '{}'", range))?;
  let len = len.parse().map_err(|_| format!("bad range '{}'", range))?;
  Ok((start, len))
}

fn parse_hunk(lines: &[&str], at: usize) -> Result<(Hunk, usize), String> {
  let header = lines[at];
  let inner = header
    .strip_prefix("@@ ")
    .and_then(|h| h.split(" @@").next())
    .ok_or_else(|| format!("line {}: malformed hunk header", at + 1))?;
  let mut parts = inner.split_whitespace();
  let old = parts
    .next()
    .and_then(|p| p.strip_prefix('-'))
    .ok_or_else(|| format!("line {}: missing old range", at + 1))?;
  let new = parts
    .next()
    .and_then(|p| p.strip_prefix('+'))
    .ok_or_else(|| format!("line {}: missing new range", at + 1))?;
  let (old_start, old_len) = parse_range(old)?;
  let (_, new_len) = parse_range(new)?;

  let mut hunk = Hunk {
    old_start,
    old_len,
    new_len,
    lines: Vec::new(),
    new_missing_newline: false,
  };

  let (mut seen_old, mut seen_new) = (0, 0);
  let mut i = at + 1;
  while i < lines.len() && (seen_old < old_len || seen_new < new_len) {
    let line = lines[i];
    match line.chars().next() {
      Some(' ') => {
        hunk.lines.push(Line::Context(line[1..].to_string()));
        seen_old += 1;
        seen_new += 1;
      }
      // some tools drop the space on empty context lines
      None | Some('\r') if line.len() <= 1 => {
        hunk.lines.push(Line::Context(line.to_string()));
        seen_old += 1;
        seen_new += 1;
      }
      Some('-') => {
        hunk.lines.push(Line::Remove(line[1..].to_string()));
        seen_old += 1;
      }
      Some('+') => {
        hunk.lines.push(Line::Add(line[1..].to_string()));
        seen_new += 1;
      }
      Some('\\') => {}
      Some(_) => return Err(format!("line {}: unexpected hunk line", i + 1)),
      // an empty line always satisfies the guard above
      None => unreachable!(),
    }
    i += 1;
  }

  while i < lines.len() && lines[i].starts_with('\\') {
    if matches!(hunk.lines.last(), Some(Line::Add(_)) | Some(Line::Context(_))) {
      hunk.new_missing_newline = true;
    }
    i += 1;
  }

  if seen_old != old_len || seen_new != new_len {
    return Err(format!(
      "hunk at line {} is truncated: expected -{} +{}, found -{} +{}",
      at + 1,
      old_len,
      new_len,
      seen_old,
      seen_new
    ));
  }

  Ok((hunk, i))
}

/// File content split into lines plus whether it ends with a newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Text {
  pub lines: Vec<String>,
  pub trailing_newline: bool,
}

impl Text {
  pub fn empty() -> Self {
    Self {
      lines: Vec::new(),
      trailing_newline: false,
    }
  }

  pub fn parse(content: &str) -> Self {
    if content.is_empty() {
      return Self::empty();
    }
    let trailing_newline = content.ends_with('\n');
    let body = content.strip_suffix('\n').unwrap_or(content);
    Self {
      lines: body.split('\n').map(str::to_string).collect(),
      trailing_newline,
    }
  }

  pub fn render(&self) -> String {
    let mut out = self.lines.join("\n");
    if self.trailing_newline && !self.lines.is_empty() {
      out.push('\n');
    }
    out
  }
}

/// Apply `hunks` to `text`. Every context and removed line must match the
/// original exactly at the position the hunk header names.
pub(crate) fn apply_hunks(text: &Text, hunks: &[Hunk]) -> Result<Text, String> {
  let original = &text.lines;
  let mut out = Vec::with_capacity(original.len());
  let mut cursor = 0usize;
  let mut trailing_newline = text.trailing_newline;

  for (n, hunk) in hunks.iter().enumerate() {
    let start = if hunk.old_len == 0 {
      hunk.old_start
    } else {
      hunk.old_start.saturating_sub(1)
    };

    if start < cursor {
      return Err(format!("hunk {} overlaps the previous hunk", n + 1));
    }
    if start + hunk.old_len > original.len() {
      return Err(format!(
        "hunk {} expects lines {}..{} but the file has {} lines",
        n + 1,
        start + 1,
        start + hunk.old_len,
        original.len()
      ));
    }

    out.extend_from_slice(&original[cursor..start]);

    let mut pos = start;
    for line in &hunk.lines {
      match line {
        Line::Context(expected) | Line::Remove(expected) => {
          if &original[pos] != expected {
            return Err(format!(
              "hunk {} does not match at line {}: expected {:?}, found {:?}",
              n + 1,
              pos + 1,
              expected,
              original[pos]
            ));
          }
          if let Line::Context(_) = line {
            out.push(original[pos].clone());
          }
          pos += 1;
        }
        Line::Add(added) => out.push(added.clone()),
      }
    }
    cursor = pos;

    if cursor == original.len() {
      trailing_newline = !hunk.new_missing_newline;
    }
  }

  out.extend_from_slice(&original[cursor..]);
  Ok(Text {
    lines: out,
    trailing_newline,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  const MODIFY: &str = "\
diff --git a/src/main.c b/src/main.c
index 1111111..2222222 100644
--- a/src/main.c
+++ b/src/main.c
@@ -1,3 +1,3 @@
 int main() {
-  return 1;
+  return 0;
 }
";

  #[test]
  fn parses_paths_and_hunks() {
    let files = parse(MODIFY).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].target(), Some("src/main.c"));
    assert_eq!(files[0].hunks[0].lines.len(), 4);
  }

  #[test]
  fn applies_exact_hunk() {
    let files = parse(MODIFY).unwrap();
    let text = Text::parse("int main() {\n  return 1;\n}\n");
    let out = apply_hunks(&text, &files[0].hunks).unwrap();
    assert_eq!(out.render(), "int main() {\n  return 0;\n}\n");
  }

  #[test]
  fn mismatched_context_is_rejected() {
    let files = parse(MODIFY).unwrap();
    let text = Text::parse("int main(void) {\n  return 1;\n}\n");
    let err = apply_hunks(&text, &files[0].hunks).unwrap_err();
    assert!(err.contains("does not match at line 1"), "{err}");
  }

  #[test]
  fn dev_null_marks_creation_and_deletion() {
    let create = parse("--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+a\n+b\n").unwrap();
    assert!(create[0].creates());
    let out = apply_hunks(&Text::empty(), &create[0].hunks).unwrap();
    assert_eq!(out.render(), "a\nb\n");

    let delete = parse("--- a/old.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-gone\n").unwrap();
    assert!(delete[0].deletes());
    let out = apply_hunks(&Text::parse("gone\n"), &delete[0].hunks).unwrap();
    assert!(out.lines.is_empty());
  }

  #[test]
  fn missing_newline_marker_is_honoured() {
    let diff = "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n\\ No newline at end of file\n";
    let files = parse(diff).unwrap();
    let out = apply_hunks(&Text::parse("old\n"), &files[0].hunks).unwrap();
    assert_eq!(out.render(), "new");
  }

  #[test]
  fn multiple_hunks_use_original_coordinates() {
    let diff = "--- a/f\n+++ b/f\n@@ -1,2 +1,3 @@\n a\n+a2\n b\n@@ -4,2 +5,2 @@\n d\n-e\n+E\n";
    let files = parse(diff).unwrap();
    let out = apply_hunks(&Text::parse("a\nb\nc\nd\ne\n"), &files[0].hunks).unwrap();
    assert_eq!(out.render(), "a\na2\nb\nc\nd\nE\n");
  }

  #[test]
  fn truncated_hunk_is_malformed() {
    let err = parse("--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n").unwrap_err();
    assert!(err.contains("truncated"), "{err}");
  }

  #[test]
  fn crlf_lines_match_crlf_files() {
    let diff = "--- a/f.txt\r\n+++ b/f.txt\r\n@@ -1,2 +1,2 @@\r\n a\r\n-b\r\n+c\r\n";
    let files = parse(diff).unwrap();
    assert_eq!(files[0].target(), Some("f.txt"));
    let out = apply_hunks(&Text::parse("a\r\nb\r\n"), &files[0].hunks).unwrap();
    assert_eq!(out.render(), "a\r\nc\r\n");
  }

  #[test]
  fn lf_diff_does_not_match_crlf_file() {
    let files = parse("--- a/f.txt\n+++ b/f.txt\n@@ -2 +2 @@\n-b\n+c\n").unwrap();
    let err = apply_hunks(&Text::parse("a\r\nb\r\n"), &files[0].hunks).unwrap_err();
    assert!(err.contains("does not match at line 2"), "{err}");
  }

  #[test]
  fn text_without_headers_is_malformed() {
    assert!(parse("just some words\n").is_err());
  }
}
