//! Abstract representation of a Java program the runtime can execute.
use log::debug;
use regex::Regex;

use crate::jvm::{CPInfo, ClassError, ClassErrorKind, ClassFile, ConstantPool};

/// The name of the method invoked to run a class file.
pub const MAIN_METHOD: &str = "main";
/// The "descriptor" string for main(). The descriptor encodes main()'s
/// signature, i.e. main() takes a String[] and returns void.
/// If you're interested, the descriptor string is explained at
/// https://docs.oracle.com/javase/specs/jvms/se12/html/jvms-4.html#jvms-4.3.2.
pub const MAIN_DESCRIPTOR: &str = "([Ljava/lang/String;)V";

/// Java class method representation for the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    name: String,
    descriptor: String,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
}

impl Method {
    /// Returns the method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the method descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Maximum operand stack depth declared by the `Code` attribute.
    #[must_use]
    pub const fn max_stack(&self) -> u16 {
        self.max_stack
    }

    /// Number of local variable slots declared by the `Code` attribute.
    #[must_use]
    pub const fn max_locals(&self) -> u16 {
        self.max_locals
    }

    /// Returns the method bytecode.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

/// Representation of the Java program we want to run: the constant pool
/// and the method table, owned for the whole run.
#[derive(Debug)]
pub struct Program {
    constant_pool: ConstantPool,
    methods: Vec<Method>,
}

impl Program {
    /// Build a new program from a parsed class file by resolving every
    /// method's name and descriptor from the constant pool.
    pub fn new(class_file: ClassFile) -> Result<Self, ClassError> {
        let ClassFile {
            constant_pool,
            methods: method_infos,
        } = class_file;

        let mut methods = Vec::with_capacity(method_infos.len());
        for info in method_infos {
            let name = constant_pool.utf8(info.name_index())?.to_string();
            let descriptor =
                constant_pool.utf8(info.descriptor_index())?.to_string();
            debug!(
                "method {name}{descriptor}: max_stack={} max_locals={} code={} bytes",
                info.code().max_stack,
                info.code().max_locals,
                info.code().code.len()
            );
            methods.push(Method {
                name,
                descriptor,
                max_stack: info.code().max_stack,
                max_locals: info.code().max_locals,
                code: info.code.code,
            });
        }

        Ok(Self {
            constant_pool,
            methods,
        })
    }

    /// Returns the underlying constant pool.
    #[must_use]
    pub fn constant_pool(&self) -> &ConstantPool {
        &self.constant_pool
    }

    /// Find a method by name and descriptor with a linear scan over the
    /// method table, matching bytewise on both fields.
    #[must_use]
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }

    /// Resolve a `MethodRef` constant down to a method in the table, going
    /// through its `NameAndType` entry. Every step is tag-checked.
    pub fn method_by_ref(
        &self,
        index: u16,
    ) -> Result<Option<&Method>, ClassError> {
        let name_and_type_index = match self.constant_pool.get(index)? {
            CPInfo::ConstantMethodRef {
                name_and_type_index,
                ..
            } => *name_and_type_index,
            _ => {
                return Err(ClassError::new(
                    ClassErrorKind::ConstantTypeMismatch {
                        expected: "MethodRef",
                        index,
                    },
                ))
            }
        };
        let (name_index, descriptor_index) =
            match self.constant_pool.get(name_and_type_index)? {
                CPInfo::ConstantNameAndType {
                    name_index,
                    descriptor_index,
                } => (*name_index, *descriptor_index),
                _ => {
                    return Err(ClassError::new(
                        ClassErrorKind::ConstantTypeMismatch {
                            expected: "NameAndType",
                            index: name_and_type_index,
                        },
                    ))
                }
            };
        let name = self.constant_pool.utf8(name_index)?;
        let descriptor = self.constant_pool.utf8(descriptor_index)?;
        Ok(self.find_method(name, descriptor))
    }

    /// The entry method every runnable class must define.
    #[must_use]
    pub fn entry_point(&self) -> Option<&Method> {
        self.find_method(MAIN_METHOD, MAIN_DESCRIPTOR)
    }
}

/// Number of parameters declared by a method descriptor.
///
/// A `[` binds to the component type that follows it, so an array counts
/// as a single parameter. Each remaining character of the parameter
/// segment counts as one parameter; reference tokens (`L...;`) are not
/// produced by the compilers this VM supports.
pub fn num_parameters(descriptor: &str) -> Result<usize, ClassError> {
    let re = Regex::new(r"\(([^)]*)\)(.+)").unwrap();
    let caps = re.captures(descriptor).ok_or_else(|| {
        ClassError::new(ClassErrorKind::BadDescriptor(descriptor.to_string()))
    })?;
    let params = caps.get(1).map_or("", |m| m.as_str());
    Ok(params.chars().filter(|&c| c != '[').count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_primitive_parameters() {
        assert_eq!(num_parameters("()V").unwrap(), 0);
        assert_eq!(num_parameters("(I)I").unwrap(), 1);
        assert_eq!(num_parameters("(II)I").unwrap(), 2);
        assert_eq!(num_parameters("(IBSZC)V").unwrap(), 5);
    }

    #[test]
    fn arrays_bind_to_their_component_type() {
        assert_eq!(num_parameters("([I)V").unwrap(), 1);
        assert_eq!(num_parameters("([II)I").unwrap(), 2);
        assert_eq!(num_parameters("(I[I[I)V").unwrap(), 3);
    }

    #[test]
    fn reference_tokens_count_per_character() {
        // Object parameters are outside the executed subset; the counting
        // rule deliberately treats every character as its own parameter.
        assert_eq!(num_parameters("(Ljava/lang/String;)V").unwrap(), 18);
    }

    #[test]
    fn rejects_descriptors_without_parentheses() {
        assert!(num_parameters("II").is_err());
        assert!(num_parameters("()").is_err());
    }
}
