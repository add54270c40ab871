//! Alias/macro preprocessing: a single textual substitution pass run over
//! the raw task document before it's parsed as YAML. Lets an author define
//! `<name>: <value>` pairs once and reference them anywhere in the document
//! as `<directive><name>`, e.g. with the default directive `$`, `$Registry`.

use std::collections::HashMap;

/// Runs the substitution pass. `directive` must be exactly one Unicode
/// scalar value (validated by [validations::validate_directive] at the
/// caller); `aliases` maps alias name to replacement text.
///
/// Two directive characters in a row (`$$`) escape to a single literal
/// directive character and are not looked up. Otherwise the directive is
/// followed by the longest run of alphanumeric characters, which is taken
/// as the alias name. Substitution is single-pass: replacement text is
/// copied into the output as-is and never rescanned for further
/// directives, so an alias value that itself contains `$Foo` is left
/// alone. An undefined `<directive><name>` is left exactly as written
/// rather than rejected, since the document may deliberately reuse the
/// directive character for something this pass shouldn't touch.
pub fn expand(
  source: &str,
  directive: char,
  aliases: &HashMap<String, String>,
) -> String {
  let chars: Vec<char> = source.chars().collect();
  let mut out = String::with_capacity(source.len());
  let mut i = 0;

  while i < chars.len() {
    let c = chars[i];
    if c != directive {
      out.push(c);
      i += 1;
      continue;
    }

    if chars.get(i + 1) == Some(&directive) {
      out.push(directive);
      i += 2;
      continue;
    }

    let name_start = i + 1;
    let mut name_end = name_start;
    while name_end < chars.len() && chars[name_end].is_alphanumeric() {
      name_end += 1;
    }

    if name_end == name_start {
      // Lone directive with nothing alias-shaped after it: pass through
      // literally rather than erroring, so `$` in e.g. a shell prompt
      // string doesn't require escaping.
      out.push(directive);
      i += 1;
      continue;
    }

    let name: String = chars[name_start..name_end].iter().collect();
    match aliases.get(&name) {
      Some(value) => out.push_str(value),
      None => {
        out.push(directive);
        out.push_str(&name);
      }
    }
    i = name_end;
  }

  out
}

#[cfg(test)]
mod test {
  use super::*;

  fn aliases(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
  }

  #[test]
  fn substitutes_known_alias() {
    let a = aliases(&[("Registry", "myregistry.io")]);
    let out = expand("build: -t $Registry/app:v1 .", '$', &a);
    assert_eq!(out, "build: -t myregistry.io/app:v1 .");
  }

  #[test]
  fn escapes_doubled_directive() {
    let a = aliases(&[]);
    let out = expand("price: $$5", '$', &a);
    assert_eq!(out, "price: $5");
  }

  #[test]
  fn longest_identifier_match() {
    let a = aliases(&[("Reg", "short"), ("Registry", "long")]);
    let out = expand("$Registry", '$', &a);
    assert_eq!(out, "long");
  }

  #[test]
  fn single_pass_does_not_rescan_replacement() {
    let a = aliases(&[("A", "$B"), ("B", "unreachable")]);
    let out = expand("$A", '$', &a);
    assert_eq!(out, "$B");
  }

  #[test]
  fn undefined_alias_is_left_unchanged() {
    let a = aliases(&[]);
    let out = expand("$Nope", '$', &a);
    assert_eq!(out, "$Nope");
  }

  #[test]
  fn lone_trailing_directive_passes_through() {
    let a = aliases(&[]);
    let out = expand("cost: 5$", '$', &a);
    assert_eq!(out, "cost: 5$");
  }

  #[test]
  fn custom_directive_character() {
    let a = aliases(&[("Tag", "v2")]);
    let out = expand("image:app:~Tag", '~', &a);
    assert_eq!(out, "image:app:v2");
  }
}
