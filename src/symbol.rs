// (C) 2020 Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

// Intern string -> dense integer id, used as the compact key for class
// methods, module globals, and instance fields. Ids are assigned once and
// never reused or renumbered, so a `SymbolId` taken early in compilation
// stays valid for the VM's whole lifetime.

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

#[derive(Default)]
pub struct SymbolTable {
    names: Vec<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable { names: Vec::new() }
    }

    // Linear search by length then content, matching spec.md 4.2. The
    // table is expected to stay small (hundreds, not millions, of distinct
    // identifiers per program) so this beats a hash map's setup cost.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(id) = self.find(name) {
            return id;
        }
        let id = SymbolId(self.names.len() as u32);
        self.names.push(name.to_string());
        id
    }

    pub fn find(&self, name: &str) -> Option<SymbolId> {
        self.names
            .iter()
            .position(|existing| existing.len() == name.len() && existing == name)
            .map(|idx| SymbolId(idx as u32))
    }

    pub fn name(&self, id: SymbolId) -> &str {
        &self.names[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

// Pre-interned ids cached on the VM for fast dispatch (`ctor`, `dtor`,
// `call`), per spec.md's glossary entry for "Build-in symbol".
pub struct BuiltinSymbols {
    pub ctor: SymbolId,
    pub dtor: SymbolId,
    pub call: SymbolId,
}

impl BuiltinSymbols {
    pub fn install(table: &mut SymbolTable) -> Self {
        BuiltinSymbols {
            ctor: table.intern("ctor"),
            dtor: table.intern("dtor"),
            call: table.intern("call"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_stable_and_content_addressed() {
        let mut table = SymbolTable::new();
        let a = table.intern("foo");
        let b = table.intern("bar");
        let a2 = table.intern("foo");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(table.name(a), "foo");
        assert_eq!(table.name(b), "bar");
    }

    #[test]
    fn ids_grow_monotonically() {
        let mut table = SymbolTable::new();
        let first = table.intern("x");
        let second = table.intern("y");
        assert!(second.0 > first.0);
    }
}
