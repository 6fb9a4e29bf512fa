//! In-memory assembly of minimal class files for tests.
//!
//! Builds the same byte layout javac produces for the supported subset:
//! magic and versions, a 1-indexed constant pool, empty interface and
//! field sections, and a method table whose methods carry a single `Code`
//! attribute with an empty exception table.

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;

/// Builder for a class-file image.
#[derive(Default)]
pub struct ClassImage {
    // Encoded constant pool entries, in 1-indexed order.
    constants: Vec<Vec<u8>>,
    // Encoded method_info records.
    methods: Vec<Vec<u8>>,
}

impl ClassImage {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_constant(&mut self, entry: Vec<u8>) -> u16 {
        self.constants.push(entry);
        self.constants.len() as u16
    }

    /// Add a `CONSTANT_Utf8` entry, returning its pool index.
    pub fn utf8(&mut self, s: &str) -> u16 {
        let mut entry = vec![1u8];
        entry.extend((s.len() as u16).to_be_bytes());
        entry.extend_from_slice(s.as_bytes());
        self.push_constant(entry)
    }

    /// Add a `CONSTANT_Integer` entry, returning its pool index.
    pub fn integer(&mut self, value: i32) -> u16 {
        let mut entry = vec![3u8];
        entry.extend(value.to_be_bytes());
        self.push_constant(entry)
    }

    /// Add a `CONSTANT_Class` entry and its name, returning its pool index.
    pub fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        let mut entry = vec![7u8];
        entry.extend(name_index.to_be_bytes());
        self.push_constant(entry)
    }

    /// Add a `CONSTANT_MethodRef` (with its `NameAndType`) pointing at a
    /// method of `class_index`, returning the MethodRef's pool index.
    pub fn method_ref(
        &mut self,
        class_index: u16,
        name: &str,
        descriptor: &str,
    ) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut name_and_type = vec![12u8];
        name_and_type.extend(name_index.to_be_bytes());
        name_and_type.extend(descriptor_index.to_be_bytes());
        let name_and_type_index = self.push_constant(name_and_type);
        let mut entry = vec![10u8];
        entry.extend(class_index.to_be_bytes());
        entry.extend(name_and_type_index.to_be_bytes());
        self.push_constant(entry)
    }

    /// Add a raw constant pool entry (tag byte included); lets tests build
    /// entries outside the supported subset.
    pub fn raw_constant(&mut self, entry: Vec<u8>) -> u16 {
        self.push_constant(entry)
    }

    /// Add a method carrying a single `Code` attribute.
    pub fn method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: &[u8],
    ) {
        let code_name_index = self.utf8("Code");
        let attribute = encode_code(max_stack, max_locals, code);
        self.method_with_attributes(
            access_flags,
            name,
            descriptor,
            &[(code_name_index, attribute)],
        );
    }

    /// Add a method with an explicit attribute list of
    /// `(name_index, payload)` pairs.
    pub fn method_with_attributes(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        attributes: &[(u16, Vec<u8>)],
    ) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut info = Vec::new();
        info.extend(access_flags.to_be_bytes());
        info.extend(name_index.to_be_bytes());
        info.extend(descriptor_index.to_be_bytes());
        info.extend((attributes.len() as u16).to_be_bytes());
        for (attribute_name_index, payload) in attributes {
            info.extend(attribute_name_index.to_be_bytes());
            info.extend((payload.len() as u32).to_be_bytes());
            info.extend_from_slice(payload);
        }
        self.methods.push(info);
    }

    /// Assemble the class-file image.
    pub fn build(&self) -> Vec<u8> {
        let mut image = Vec::new();
        image.extend(0xCAFE_BABE_u32.to_be_bytes());
        image.extend(0u16.to_be_bytes()); // minor_version
        image.extend(63u16.to_be_bytes()); // major_version
        image.extend((self.constants.len() as u16 + 1).to_be_bytes());
        for entry in &self.constants {
            image.extend_from_slice(entry);
        }
        image.extend(0x0021u16.to_be_bytes()); // access_flags
        image.extend(0u16.to_be_bytes()); // this_class
        image.extend(0u16.to_be_bytes()); // super_class
        image.extend(0u16.to_be_bytes()); // interfaces_count
        image.extend(0u16.to_be_bytes()); // fields_count
        image.extend((self.methods.len() as u16).to_be_bytes());
        for info in &self.methods {
            image.extend_from_slice(info);
        }
        image.extend(0u16.to_be_bytes()); // class attributes_count
        image
    }
}

/// Encode a `Code` attribute payload with an empty exception table and no
/// nested attributes.
pub fn encode_code(max_stack: u16, max_locals: u16, code: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend(max_stack.to_be_bytes());
    payload.extend(max_locals.to_be_bytes());
    payload.extend((code.len() as u32).to_be_bytes());
    payload.extend_from_slice(code);
    payload.extend(0u16.to_be_bytes()); // exception_table_length
    payload.extend(0u16.to_be_bytes()); // attributes_count
    payload
}
