use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Compiler behavior toggles. Flags accumulate across merges; a flag is
/// active when present at least once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompilerFlag {
    /// Keep comments/blank lines/line directives in preprocessed output.
    /// Lowers job-cache hit rates; intended for debugging.
    DisableSourceStripping,
    KeepDebugInfo,
    GenerateSymbols,
    StandardOptimization,
    PreferFlowControl,
    WarningsAsErrors,
}

/// A resource-table binding: ties a uniform buffer member to a bind point.
/// Member names are referenced by index into the owning uniform buffer's
/// name table, so entries stay valid across serialization without pointer
/// fix-up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTableEntry {
    pub uniform_buffer: String,
    pub member_name_index: usize,
    pub member_type: u8,
    pub base_index: u16,
}

/// Declaration of a uniform buffer referenced by the shader, including the
/// name table that resource-table entries index into.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniformBufferEntry {
    pub layout_hash: u32,
    pub member_names: Vec<String>,
}

/// The merged set of inputs that can affect compilation besides the source
/// itself: macro definitions, compiler flags and arguments, resource-table
/// bindings and per-target render-target formats.
///
/// Maps are `BTreeMap` so iteration order (and therefore hashing and wire
/// serialization) is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompileEnvironment {
    pub definitions: BTreeMap<String, String>,
    pub flags: Vec<CompilerFlag>,
    pub compile_args: Vec<String>,
    /// Injected in-memory file contents, keyed by virtual path.
    pub include_contents: BTreeMap<String, String>,
    pub resource_tables: Vec<ResourceTableEntry>,
    pub uniform_buffers: BTreeMap<String, UniformBufferEntry>,
    /// Render-target output formats, keyed by target index.
    pub render_target_formats: BTreeMap<u32, u8>,
    pub full_precision: bool,
}

impl CompileEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_define(&mut self, name: impl Into<String>, value: impl ToString) {
        self.definitions.insert(name.into(), value.to_string());
    }

    pub fn has_flag(&self, flag: CompilerFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn add_flag(&mut self, flag: CompilerFlag) {
        self.flags.push(flag);
    }

    /// Merges `other` into `self`.
    ///
    /// Collections union: flags, compile args and resource tables append;
    /// injected include contents append per key. Definitions merge with
    /// `other`'s value winning on conflict. Uniform buffers keep the existing
    /// entry on conflict, so resource-table name indices established against
    /// `self` remain valid.
    pub fn merge(&mut self, other: &CompileEnvironment) {
        for (path, contents) in &other.include_contents {
            self.include_contents
                .entry(path.clone())
                .and_modify(|existing| existing.push_str(contents))
                .or_insert_with(|| contents.clone());
        }

        self.flags.extend(other.flags.iter().copied());
        self.compile_args.extend(other.compile_args.iter().cloned());
        self.resource_tables.extend(other.resource_tables.iter().cloned());

        for (name, buffer) in &other.uniform_buffers {
            self.uniform_buffers
                .entry(name.clone())
                .or_insert_with(|| buffer.clone());
        }

        for (name, value) in &other.definitions {
            self.definitions.insert(name.clone(), value.clone());
        }

        for (target, format) in &other.render_target_formats {
            self.render_target_formats.insert(*target, *format);
        }
        self.full_precision |= other.full_precision;
    }

    /// Feeds every compile-relevant field to `hasher` in a fixed order.
    /// This is the environment's contribution to the job input hash; any
    /// field that can change compiled output must be included here.
    pub fn hash_dependencies(&self, hasher: &mut blake3::Hasher) {
        for (name, value) in &self.definitions {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        for flag in &self.flags {
            hasher.update(&(*flag as u32).to_le_bytes());
        }
        for arg in &self.compile_args {
            hasher.update(arg.as_bytes());
        }
        for (path, contents) in &self.include_contents {
            hasher.update(path.as_bytes());
            hasher.update(contents.as_bytes());
        }
        for entry in &self.resource_tables {
            hasher.update(entry.uniform_buffer.as_bytes());
            hasher.update(&(entry.member_name_index as u64).to_le_bytes());
            hasher.update(&[entry.member_type]);
            hasher.update(&entry.base_index.to_le_bytes());
        }
        for (name, buffer) in &self.uniform_buffers {
            hasher.update(name.as_bytes());
            hasher.update(&buffer.layout_hash.to_le_bytes());
            for member in &buffer.member_names {
                hasher.update(member.as_bytes());
            }
        }
        for (target, format) in &self.render_target_formats {
            hasher.update(&target.to_le_bytes());
            hasher.update(&[*format]);
        }
        hasher.update(&[self.full_precision as u8]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_in_definitions_override() {
        let mut a = CompileEnvironment::new();
        a.set_define("X", 1);
        a.add_flag(CompilerFlag::KeepDebugInfo);
        let mut b = CompileEnvironment::new();
        b.set_define("X", 2);
        b.add_flag(CompilerFlag::GenerateSymbols);

        let mut ab = a.clone();
        ab.merge(&b);
        assert_eq!(ab.definitions["X"], "2");
        assert_eq!(
            ab.flags,
            vec![CompilerFlag::KeepDebugInfo, CompilerFlag::GenerateSymbols]
        );

        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ba.definitions["X"], "1");
        assert_eq!(
            ba.flags,
            vec![CompilerFlag::GenerateSymbols, CompilerFlag::KeepDebugInfo]
        );
    }

    #[test]
    fn uniform_buffers_keep_existing_entries() {
        let mut a = CompileEnvironment::new();
        a.uniform_buffers.insert(
            "View".into(),
            UniformBufferEntry { layout_hash: 1, member_names: vec!["A".into()] },
        );
        let mut b = CompileEnvironment::new();
        b.uniform_buffers.insert(
            "View".into(),
            UniformBufferEntry { layout_hash: 2, member_names: vec!["B".into()] },
        );
        a.merge(&b);
        assert_eq!(a.uniform_buffers["View"].layout_hash, 1);
    }

    #[test]
    fn include_contents_append_per_key() {
        let mut a = CompileEnvironment::new();
        a.include_contents.insert("/Generated/X.ush".into(), "one".into());
        let mut b = CompileEnvironment::new();
        b.include_contents.insert("/Generated/X.ush".into(), "two".into());
        b.include_contents.insert("/Generated/Y.ush".into(), "new".into());
        a.merge(&b);
        assert_eq!(a.include_contents["/Generated/X.ush"], "onetwo");
        assert_eq!(a.include_contents["/Generated/Y.ush"], "new");
    }

    #[test]
    fn hash_covers_every_field() {
        fn digest(env: &CompileEnvironment) -> blake3::Hash {
            let mut hasher = blake3::Hasher::new();
            env.hash_dependencies(&mut hasher);
            hasher.finalize()
        }
        let base = CompileEnvironment::new();
        let mut with_define = base.clone();
        with_define.set_define("A", 1);
        let mut with_flag = base.clone();
        with_flag.add_flag(CompilerFlag::WarningsAsErrors);
        let mut with_format = base.clone();
        with_format.render_target_formats.insert(0, 3);

        let digests = [
            digest(&base),
            digest(&with_define),
            digest(&with_flag),
            digest(&with_format),
        ];
        for (i, a) in digests.iter().enumerate() {
            for b in &digests[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
