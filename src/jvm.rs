//! Lightweight binary parser for Java class files.
use byteorder::{BigEndian, ReadBytesExt};

use std::fmt;
use std::io;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use log::debug;

/// Values of magic bytes of a JVM class file.
const CLASS_FILE_MAGIC: u32 = 0xCAFE_BABE;

/// Access flag marking a method as static.
const ACC_STATIC: u16 = 0x0008;

/// `ClassErrorKind` represents the structural faults a class file can
/// exhibit during loading.
#[derive(Debug)]
pub enum ClassErrorKind {
    BadMagic(u32),
    UnknownConstantTag(u8),
    BadConstantIndex(u16),
    ConstantTypeMismatch { expected: &'static str, index: u16 },
    UnexpectedInterfaces(u16),
    UnexpectedFields(u16),
    NonStaticMethod(String),
    MissingCode(String),
    DuplicateCode(String),
    InvalidUtf8(u16),
    BadDescriptor(String),
    Io(io::Error),
}

/// `ClassError` is the error type for class-file loading; every variant is
/// fatal to the load.
#[derive(Debug)]
pub struct ClassError {
    kind: ClassErrorKind,
}

impl ClassError {
    pub(crate) fn new(kind: ClassErrorKind) -> Self {
        Self { kind }
    }

    /// Returns the fault behind this error.
    #[must_use]
    pub fn kind(&self) -> &ClassErrorKind {
        &self.kind
    }
}

impl fmt::Display for ClassError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ClassErrorKind::BadMagic(magic) => {
                write!(f, "bad magic number {magic:#010x}, expected 0xcafebabe")
            }
            ClassErrorKind::UnknownConstantTag(tag) => {
                write!(f, "unknown constant pool tag {tag}")
            }
            ClassErrorKind::BadConstantIndex(index) => {
                write!(f, "constant pool index {index} is out of range")
            }
            ClassErrorKind::ConstantTypeMismatch { expected, index } => {
                write!(f, "constant pool entry {index} is not a {expected}")
            }
            ClassErrorKind::UnexpectedInterfaces(count) => {
                write!(f, "interfaces are not supported, found {count}")
            }
            ClassErrorKind::UnexpectedFields(count) => {
                write!(f, "fields are not supported, found {count}")
            }
            ClassErrorKind::NonStaticMethod(name) => {
                write!(f, "method {name} must be static")
            }
            ClassErrorKind::MissingCode(name) => {
                write!(f, "method {name} has no Code attribute")
            }
            ClassErrorKind::DuplicateCode(name) => {
                write!(f, "method {name} has more than one Code attribute")
            }
            ClassErrorKind::InvalidUtf8(index) => {
                write!(f, "constant pool entry {index} is not valid UTF-8")
            }
            ClassErrorKind::BadDescriptor(descriptor) => {
                write!(f, "malformed method descriptor {descriptor}")
            }
            ClassErrorKind::Io(err) => {
                write!(f, "truncated or unreadable class file: {err}")
            }
        }
    }
}

impl std::error::Error for ClassError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ClassErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ClassError {
    fn from(err: io::Error) -> Self {
        Self::new(ClassErrorKind::Io(err))
    }
}

/// `CPInfo` represents constant pool entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CPInfo {
    ConstantClass {
        name_index: u16,
    },
    ConstantFieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantInteger {
        value: i32,
    },
    ConstantNameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    ConstantUtf8 {
        bytes: String,
    },
    // Proxy value occupying the reserved entry at index 0.
    Unspecified,
}

/// `ConstantKind` encodes the kind of a constant in the constants pool.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ConstantKind {
    Utf8 = 1,
    Integer = 3,
    Class = 7,
    FieldRef = 9,
    MethodRef = 10,
    NameAndType = 12,
    Unspecified,
}

impl From<u8> for ConstantKind {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Utf8,
            3 => Self::Integer,
            7 => Self::Class,
            9 => Self::FieldRef,
            10 => Self::MethodRef,
            12 => Self::NameAndType,
            _ => Self::Unspecified,
        }
    }
}

/// The class file's table of constants, addressed 1-indexed by bytecode
/// operands and by the method table. Entry 0 is reserved by the container
/// format and not addressable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantPool {
    entries: Vec<CPInfo>,
}

impl ConstantPool {
    /// Number of addressable entries, excluding the reserved entry 0.
    #[must_use]
    pub fn size(&self) -> u16 {
        (self.entries.len() - 1) as u16
    }

    /// Bounds-checked lookup; valid indices are `1..=size`.
    pub fn get(&self, index: u16) -> Result<&CPInfo, ClassError> {
        if index == 0 || usize::from(index) >= self.entries.len() {
            return Err(ClassError::new(ClassErrorKind::BadConstantIndex(index)));
        }
        Ok(&self.entries[usize::from(index)])
    }

    /// Lookup that asserts the entry is a `Utf8` constant.
    pub fn utf8(&self, index: u16) -> Result<&str, ClassError> {
        match self.get(index)? {
            CPInfo::ConstantUtf8 { bytes } => Ok(bytes),
            _ => Err(ClassError::new(ClassErrorKind::ConstantTypeMismatch {
                expected: "Utf8",
                index,
            })),
        }
    }
}

/// The `Code` attribute of a method: stack and locals bounds plus the
/// bytecode itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) code: CodeAttribute,
}

impl MethodInfo {
    /// Returns method info name index.
    #[must_use]
    pub const fn name_index(&self) -> u16 {
        self.name_index
    }

    /// Returns method info descriptor index.
    #[must_use]
    pub const fn descriptor_index(&self) -> u16 {
        self.descriptor_index
    }

    /// Returns the method's `Code` attribute.
    #[must_use]
    pub const fn code(&self) -> &CodeAttribute {
        &self.code
    }
}

/// `ClassFile` represents a parsed Java class file: the constant pool and
/// the method table. Header and class-info fields are consumed during
/// parsing but not retained.
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub(crate) constant_pool: ConstantPool,
    pub(crate) methods: Vec<MethodInfo>,
}

impl ClassFile {
    /// Returns the underlying constant pool.
    #[must_use]
    pub fn constant_pool(&self) -> &ConstantPool {
        &self.constant_pool
    }

    /// Returns the underlying method table.
    #[must_use]
    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }
}

/// `ClassParser` namespaces functions that handle parsing of Java class
/// files.
#[derive(Debug)]
pub struct ClassParser;

impl ClassParser {
    /// Parse a Java class file.
    /// # Errors
    /// Returns `ClassError` when the file is truncated or violates one of
    /// the structural constraints of the supported subset.
    pub fn parse(class_file_bytes: &[u8]) -> Result<ClassFile, ClassError> {
        // Create a new cursor on the class file bytes.
        let mut buffer = Cursor::new(class_file_bytes);
        // Read and verify the magic header.
        let magic = buffer.read_u32::<BigEndian>()?;
        if magic != CLASS_FILE_MAGIC {
            return Err(ClassError::new(ClassErrorKind::BadMagic(magic)));
        }
        // The class file version numbers are skipped past.
        let _minor_version = buffer.read_u16::<BigEndian>()?;
        let _major_version = buffer.read_u16::<BigEndian>()?;

        let constant_pool = parse_constant_pool(&mut buffer)?;

        // Access flags and this/super indices are skipped past.
        let _access_flags = buffer.read_u16::<BigEndian>()?;
        let _this_class = buffer.read_u16::<BigEndian>()?;
        let _super_class = buffer.read_u16::<BigEndian>()?;

        let interfaces_count = buffer.read_u16::<BigEndian>()?;
        if interfaces_count != 0 {
            return Err(ClassError::new(ClassErrorKind::UnexpectedInterfaces(
                interfaces_count,
            )));
        }
        let fields_count = buffer.read_u16::<BigEndian>()?;
        if fields_count != 0 {
            return Err(ClassError::new(ClassErrorKind::UnexpectedFields(
                fields_count,
            )));
        }

        let methods = parse_methods(&mut buffer, &constant_pool)?;
        debug!(
            "loaded class with {} constants and {} methods",
            constant_pool.size(),
            methods.len()
        );
        Ok(ClassFile {
            constant_pool,
            methods,
        })
    }
}

/// Parse the constant pool. The on-disk count is one more than the number
/// of real entries because index 0 is reserved.
fn parse_constant_pool(
    reader: &mut (impl Read + Seek),
) -> Result<ConstantPool, ClassError> {
    let constant_pool_count = reader.read_u16::<BigEndian>()?;
    let mut entries =
        vec![CPInfo::Unspecified; usize::from(constant_pool_count.max(1))];
    // The first entry in the pool is at index 1 according to JVM spec.
    for ii in 1..usize::from(constant_pool_count) {
        let tag = reader.read_u8()?;
        entries[ii] = match ConstantKind::from(tag) {
            ConstantKind::Utf8 => {
                let length = reader.read_u16::<BigEndian>()?;
                let mut buf = vec![0u8; usize::from(length)];
                reader.read_exact(&mut buf)?;
                let bytes = String::from_utf8(buf).map_err(|_| {
                    ClassError::new(ClassErrorKind::InvalidUtf8(ii as u16))
                })?;
                CPInfo::ConstantUtf8 { bytes }
            }
            ConstantKind::Integer => CPInfo::ConstantInteger {
                value: reader.read_i32::<BigEndian>()?,
            },
            ConstantKind::Class => CPInfo::ConstantClass {
                name_index: reader.read_u16::<BigEndian>()?,
            },
            ConstantKind::FieldRef => CPInfo::ConstantFieldRef {
                class_index: reader.read_u16::<BigEndian>()?,
                name_and_type_index: reader.read_u16::<BigEndian>()?,
            },
            ConstantKind::MethodRef => CPInfo::ConstantMethodRef {
                class_index: reader.read_u16::<BigEndian>()?,
                name_and_type_index: reader.read_u16::<BigEndian>()?,
            },
            ConstantKind::NameAndType => CPInfo::ConstantNameAndType {
                name_index: reader.read_u16::<BigEndian>()?,
                descriptor_index: reader.read_u16::<BigEndian>()?,
            },
            ConstantKind::Unspecified => {
                return Err(ClassError::new(ClassErrorKind::UnknownConstantTag(
                    tag,
                )))
            }
        };
    }
    Ok(ConstantPool { entries })
}

/// Parse the method table.
fn parse_methods(
    reader: &mut (impl Read + Seek),
    constant_pool: &ConstantPool,
) -> Result<Vec<MethodInfo>, ClassError> {
    let method_count = reader.read_u16::<BigEndian>()?;
    let mut methods = Vec::with_capacity(usize::from(method_count));

    for _ in 0..method_count {
        let access_flags = reader.read_u16::<BigEndian>()?;
        let name_index = reader.read_u16::<BigEndian>()?;
        let descriptor_index = reader.read_u16::<BigEndian>()?;
        let name = constant_pool.utf8(name_index)?;
        constant_pool.utf8(descriptor_index)?;

        // javac emits a constructor we never execute; every other method
        // must be static.
        if name != "<init>" && access_flags & ACC_STATIC == 0 {
            return Err(ClassError::new(ClassErrorKind::NonStaticMethod(
                name.to_string(),
            )));
        }

        let code = parse_method_attributes(reader, constant_pool, name)?;
        methods.push(MethodInfo {
            name_index,
            descriptor_index,
            code,
        });
    }

    Ok(methods)
}

/// Parse a method's attributes, keeping the single required `Code`
/// attribute and skipping everything else by its declared length.
fn parse_method_attributes(
    reader: &mut (impl Read + Seek),
    constant_pool: &ConstantPool,
    method_name: &str,
) -> Result<CodeAttribute, ClassError> {
    let attribute_count = reader.read_u16::<BigEndian>()?;
    let mut code = None;

    for _ in 0..attribute_count {
        let attribute_name_index = reader.read_u16::<BigEndian>()?;
        let attribute_length = reader.read_u32::<BigEndian>()?;
        let attribute_end =
            reader.stream_position()? + u64::from(attribute_length);
        let attribute_name = constant_pool.utf8(attribute_name_index)?;

        if attribute_name == "Code" {
            if code.is_some() {
                return Err(ClassError::new(ClassErrorKind::DuplicateCode(
                    method_name.to_string(),
                )));
            }
            let max_stack = reader.read_u16::<BigEndian>()?;
            let max_locals = reader.read_u16::<BigEndian>()?;
            let code_length = reader.read_u32::<BigEndian>()?;
            let mut buf = vec![0u8; code_length as usize];
            reader.read_exact(&mut buf)?;
            code = Some(CodeAttribute {
                max_stack,
                max_locals,
                code: buf,
            });
        }
        // The exception table, nested attributes and any non-Code
        // attribute are skipped by the declared attribute length.
        reader.seek(SeekFrom::Start(attribute_end))?;
    }

    code.ok_or_else(|| {
        ClassError::new(ClassErrorKind::MissingCode(method_name.to_string()))
    })
}

/// Helper function to read a class file into a buffer.
/// # Errors
/// Returns `io::Error` when the file cannot be opened or read.
pub fn read_class_file(fp: &Path) -> io::Result<Vec<u8>> {
    use std::fs::File;
    use std::io::prelude::*;

    let mut f = File::open(fp)?;
    let mut buffer = Vec::new();
    f.read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(entries: Vec<CPInfo>) -> ConstantPool {
        let mut all = vec![CPInfo::Unspecified];
        all.extend(entries);
        ConstantPool { entries: all }
    }

    #[test]
    fn pool_is_one_indexed() {
        let cp = pool(vec![CPInfo::ConstantInteger { value: 7 }]);
        assert_eq!(cp.size(), 1);
        assert_eq!(cp.get(1).unwrap(), &CPInfo::ConstantInteger { value: 7 });
        assert!(matches!(
            cp.get(0).unwrap_err().kind(),
            ClassErrorKind::BadConstantIndex(0)
        ));
        assert!(matches!(
            cp.get(2).unwrap_err().kind(),
            ClassErrorKind::BadConstantIndex(2)
        ));
    }

    #[test]
    fn utf8_lookup_checks_the_tag() {
        let cp = pool(vec![
            CPInfo::ConstantUtf8 {
                bytes: "main".to_string(),
            },
            CPInfo::ConstantInteger { value: 3 },
        ]);
        assert_eq!(cp.utf8(1).unwrap(), "main");
        assert!(matches!(
            cp.utf8(2).unwrap_err().kind(),
            ClassErrorKind::ConstantTypeMismatch {
                expected: "Utf8",
                index: 2
            }
        ));
    }

    #[test]
    fn rejects_bad_magic() {
        let err = ClassParser::parse(&[0xde, 0xad, 0xbe, 0xef]).unwrap_err();
        assert!(matches!(
            err.kind(),
            ClassErrorKind::BadMagic(0xdead_beef)
        ));
    }

    #[test]
    fn truncated_input_is_fatal() {
        let err = ClassParser::parse(&[0xca, 0xfe]).unwrap_err();
        assert!(matches!(err.kind(), ClassErrorKind::Io(_)));
    }

    #[test]
    fn rejects_unknown_constant_tags() {
        let mut image = vec![0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 63];
        image.extend(2u16.to_be_bytes());
        // Tag 8 is CONSTANT_String, outside the supported subset.
        image.push(8);
        image.extend(1u16.to_be_bytes());
        let err = ClassParser::parse(&image).unwrap_err();
        assert!(matches!(err.kind(), ClassErrorKind::UnknownConstantTag(8)));
    }
}
