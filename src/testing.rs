//! In-memory class file assembly for unit tests.

use crate::bytecode;
use crate::classfile::{
    AttributeInfo, BootstrapMethod, ClassFile, CodeAttribute, ConstantPool, MemberInfo,
    REF_INVOKE_STATIC, put_u16, write_bootstrap_methods,
};
use crate::opcodes;

const ACC_SUPER: u16 = 0x0020;
const METAFACTORY_DESCRIPTOR: &str = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodType;Ljava/lang/invoke/MethodHandle;Ljava/lang/invoke/MethodType;)Ljava/lang/invoke/CallSite;";

/// Annotation to attach to a built class or method.
#[derive(Clone, Debug)]
pub(crate) struct TestAnnotation {
    descriptor: String,
    elements: Vec<(String, TestElement)>,
}

#[derive(Clone, Debug)]
enum TestElement {
    Class(String),
    Str(String),
    Annotations(Vec<TestAnnotation>),
}

impl TestAnnotation {
    pub(crate) fn marker(descriptor: &str) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            elements: Vec::new(),
        }
    }

    /// `@Kind(clazz = target.class, method = "name")`.
    pub(crate) fn advice(descriptor: &str, target_class: &str, method: &str) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            elements: vec![
                (
                    "clazz".to_string(),
                    TestElement::Class(format!("L{target_class};")),
                ),
                ("method".to_string(), TestElement::Str(method.to_string())),
            ],
        }
    }

    /// Repeatable container holding `values` under `value`.
    pub(crate) fn container(descriptor: &str, values: Vec<TestAnnotation>) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            elements: vec![("value".to_string(), TestElement::Annotations(values))],
        }
    }

    fn encode(&self, pool: &mut ConstantPool, out: &mut Vec<u8>) {
        put_u16(out, pool.add_utf8(&self.descriptor).expect("annotation type"));
        put_u16(out, self.elements.len() as u16);
        for (name, element) in &self.elements {
            put_u16(out, pool.add_utf8(name).expect("element name"));
            match element {
                TestElement::Class(descriptor) => {
                    out.push(b'c');
                    put_u16(out, pool.add_utf8(descriptor).expect("class literal"));
                }
                TestElement::Str(value) => {
                    out.push(b's');
                    put_u16(out, pool.add_utf8(value).expect("string element"));
                }
                TestElement::Annotations(values) => {
                    out.push(b'[');
                    put_u16(out, values.len() as u16);
                    for value in values {
                        out.push(b'@');
                        value.encode(pool, out);
                    }
                }
            }
        }
    }
}

/// Builder for minimal but valid class files.
pub(crate) struct ClassBuilder {
    pool: ConstantPool,
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    methods: Vec<MemberInfo>,
    annotations: Vec<TestAnnotation>,
    bootstrap_methods: Vec<BootstrapMethod>,
}

impl ClassBuilder {
    pub(crate) fn new(name: &str) -> Self {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class(name).expect("this class");
        let super_class = pool.add_class("java/lang/Object").expect("super class");
        Self {
            pool,
            access_flags: crate::classfile::ACC_PUBLIC | ACC_SUPER,
            this_class,
            super_class,
            interfaces: Vec::new(),
            methods: Vec::new(),
            annotations: Vec::new(),
            bootstrap_methods: Vec::new(),
        }
    }

    pub(crate) fn super_name(mut self, name: &str) -> Self {
        self.super_class = self.pool.add_class(name).expect("super class");
        self
    }

    pub(crate) fn interface(mut self, name: &str) -> Self {
        let index = self.pool.add_class(name).expect("interface");
        self.interfaces.push(index);
        self
    }

    pub(crate) fn access(mut self, access_flags: u16) -> Self {
        self.access_flags = access_flags;
        self
    }

    pub(crate) fn annotation(mut self, annotation: TestAnnotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub(crate) fn method(
        mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        code: Vec<u8>,
        max_stack: u16,
        max_locals: u16,
    ) -> Self {
        let code_name = self.pool.add_utf8("Code").expect("code name");
        let info = CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        }
        .to_bytes();
        self.push_method(
            access_flags,
            name,
            descriptor,
            vec![AttributeInfo {
                name_index: code_name,
                info,
            }],
        );
        self
    }

    /// Method without a Code attribute (abstract or native).
    pub(crate) fn abstract_method(mut self, access_flags: u16, name: &str, descriptor: &str) -> Self {
        self.push_method(access_flags, name, descriptor, Vec::new());
        self
    }

    /// Attach an invisible annotation to the most recently added method.
    pub(crate) fn method_annotation(mut self, annotation: TestAnnotation) -> Self {
        let name_index = self
            .pool
            .add_utf8("RuntimeInvisibleAnnotations")
            .expect("annotations name");
        let mut info = Vec::new();
        put_u16(&mut info, 1);
        annotation.encode(&mut self.pool, &mut info);
        let method = self.methods.last_mut().expect("method to annotate");
        match method
            .attributes
            .iter_mut()
            .find(|attribute| attribute.name_index == name_index)
        {
            Some(attribute) => {
                let count = u16::from_be_bytes([attribute.info[0], attribute.info[1]]) + 1;
                attribute.info[..2].copy_from_slice(&count.to_be_bytes());
                attribute.info.extend_from_slice(&info[2..]);
            }
            None => method.attributes.push(AttributeInfo { name_index, info }),
        }
        self
    }

    pub(crate) fn method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> u16 {
        self.pool
            .add_method_ref(owner, name, descriptor, interface)
            .expect("method ref")
    }

    /// `LambdaMetafactory` call site producing `interface` whose `sam_name`
    /// is implemented by the handle `(kind, owner.name descriptor)`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn lambda(
        &mut self,
        call_site_descriptor: &str,
        sam_name: &str,
        sam_descriptor: &str,
        kind: u8,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> u16 {
        let metafactory = self.method_ref(
            "java/lang/invoke/LambdaMetafactory",
            "metafactory",
            METAFACTORY_DESCRIPTOR,
            false,
        );
        let bootstrap = self
            .pool
            .add_method_handle(REF_INVOKE_STATIC, metafactory)
            .expect("bootstrap handle");
        let erased = self.pool.add_method_type(sam_descriptor).expect("sam type");
        let target = self.method_ref(owner, name, descriptor, false);
        let handle = self
            .pool
            .add_method_handle(kind, target)
            .expect("implementation handle");
        self.bootstrap_methods.push(BootstrapMethod {
            method_ref: bootstrap,
            arguments: vec![erased, handle, erased],
        });
        let index = (self.bootstrap_methods.len() - 1) as u16;
        self.pool
            .add_invoke_dynamic(index, sam_name, call_site_descriptor)
            .expect("invokedynamic")
    }

    pub(crate) fn build(mut self) -> Vec<u8> {
        let mut attributes = Vec::new();
        if !self.annotations.is_empty() {
            let name_index = self
                .pool
                .add_utf8("RuntimeInvisibleAnnotations")
                .expect("annotations name");
            let mut info = Vec::new();
            put_u16(&mut info, self.annotations.len() as u16);
            for annotation in &self.annotations {
                annotation.encode(&mut self.pool, &mut info);
            }
            attributes.push(AttributeInfo { name_index, info });
        }
        if !self.bootstrap_methods.is_empty() {
            let name_index = self
                .pool
                .add_utf8("BootstrapMethods")
                .expect("bootstrap name");
            attributes.push(AttributeInfo {
                name_index,
                info: write_bootstrap_methods(&self.bootstrap_methods),
            });
        }
        ClassFile {
            minor_version: 0,
            major_version: 52,
            constant_pool: self.pool,
            access_flags: self.access_flags,
            this_class: self.this_class,
            super_class: self.super_class,
            interfaces: self.interfaces,
            fields: Vec::new(),
            methods: self.methods,
            attributes,
        }
        .to_bytes()
    }

    fn push_method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        attributes: Vec<AttributeInfo>,
    ) {
        let name_index = self.pool.add_utf8(name).expect("method name");
        let descriptor_index = self.pool.add_utf8(descriptor).expect("method descriptor");
        self.methods.push(MemberInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
    }
}

/// `opcode indexbyte1 indexbyte2`, padded for the invoke forms that need it.
pub(crate) fn invoke(opcode: u8, index: u16, argument_slots: u8) -> Vec<u8> {
    let [high, low] = index.to_be_bytes();
    match opcode {
        opcodes::INVOKEINTERFACE => vec![opcode, high, low, argument_slots + 1, 0],
        opcodes::INVOKEDYNAMIC => vec![opcode, high, low, 0, 0],
        _ => vec![opcode, high, low],
    }
}

/// Invocations of a method, rendered as `owner.name` in code order.
pub(crate) fn invoked_methods(bytes: &[u8], method: &str, descriptor: &str) -> Vec<String> {
    let class = ClassFile::parse(bytes).expect("parse woven class");
    let body = method_body(&class, method, descriptor);
    body.items
        .iter()
        .filter(|item| opcodes::is_method_invoke(item.insn.opcode()))
        .filter_map(|item| item.insn.pool_index())
        .map(|index| {
            let target = class.constant_pool.member_ref(index).expect("invoke target");
            format!("{}.{}", target.owner, target.name)
        })
        .collect()
}

/// Opcodes of a method in code order.
pub(crate) fn method_opcodes(bytes: &[u8], method: &str, descriptor: &str) -> Vec<u8> {
    let class = ClassFile::parse(bytes).expect("parse woven class");
    method_body(&class, method, descriptor)
        .items
        .iter()
        .map(|item| item.insn.opcode())
        .collect()
}

pub(crate) fn method_body(class: &ClassFile, method: &str, descriptor: &str) -> crate::ir::MethodBody {
    let pool = &class.constant_pool;
    let member = class
        .methods
        .iter()
        .find(|member| {
            member.name(pool).expect("name") == method
                && member.descriptor(pool).expect("descriptor") == descriptor
        })
        .unwrap_or_else(|| panic!("method {method}{descriptor} not found"));
    let attribute = member.attribute(pool, "Code").expect("code attribute");
    let code = CodeAttribute::parse(&attribute.info).expect("parse code");
    bytecode::decode(&code).expect("decode code")
}
