//! Lossless class file container codec.
//!
//! Everything the weaver does not edit is kept as raw bytes so that
//! re-serializing an untouched structure reproduces the input exactly.

use anyhow::{Context, Result};

const MAGIC: u32 = 0xCAFE_BABE;

pub(crate) const ACC_PUBLIC: u16 = 0x0001;
pub(crate) const ACC_PRIVATE: u16 = 0x0002;
pub(crate) const ACC_STATIC: u16 = 0x0008;
pub(crate) const ACC_FINAL: u16 = 0x0010;
pub(crate) const ACC_INTERFACE: u16 = 0x0200;
pub(crate) const ACC_ABSTRACT: u16 = 0x0400;
pub(crate) const ACC_SYNTHETIC: u16 = 0x1000;

pub(crate) const REF_INVOKE_VIRTUAL: u8 = 5;
pub(crate) const REF_INVOKE_STATIC: u8 = 6;
pub(crate) const REF_INVOKE_SPECIAL: u8 = 7;
pub(crate) const REF_NEW_INVOKE_SPECIAL: u8 = 8;
pub(crate) const REF_INVOKE_INTERFACE: u8 = 9;

/// Constant pool entry. UTF-8 payloads stay in their modified UTF-8 encoding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Constant {
    Utf8(Vec<u8>),
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref(u16, u16),
    Methodref(u16, u16),
    InterfaceMethodref(u16, u16),
    NameAndType(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    Dynamic(u16, u16),
    InvokeDynamic(u16, u16),
    Module(u16),
    Package(u16),
    /// Index 0 and the slot following a Long or Double.
    Unusable,
}

mod tags {
    pub(super) const UTF8: u8 = 1;
    pub(super) const INTEGER: u8 = 3;
    pub(super) const FLOAT: u8 = 4;
    pub(super) const LONG: u8 = 5;
    pub(super) const DOUBLE: u8 = 6;
    pub(super) const CLASS: u8 = 7;
    pub(super) const STRING: u8 = 8;
    pub(super) const FIELDREF: u8 = 9;
    pub(super) const METHODREF: u8 = 10;
    pub(super) const INTERFACE_METHODREF: u8 = 11;
    pub(super) const NAME_AND_TYPE: u8 = 12;
    pub(super) const METHOD_HANDLE: u8 = 15;
    pub(super) const METHOD_TYPE: u8 = 16;
    pub(super) const DYNAMIC: u8 = 17;
    pub(super) const INVOKE_DYNAMIC: u8 = 18;
    pub(super) const MODULE: u8 = 19;
    pub(super) const PACKAGE: u8 = 20;
}

/// Resolved Methodref or InterfaceMethodref.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MemberRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) interface: bool,
}

/// Resolved CONSTANT_MethodHandle pointing at a method.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodHandle {
    pub(crate) kind: u8,
    pub(crate) target: MemberRef,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    pub(crate) fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }

    fn parse(reader: &mut ByteReader<'_>) -> Result<Self> {
        let count = reader.u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);
        while entries.len() < count as usize {
            let tag = reader.u8()?;
            let constant = match tag {
                tags::UTF8 => {
                    let len = reader.u16()? as usize;
                    Constant::Utf8(reader.bytes(len)?.to_vec())
                }
                tags::INTEGER => Constant::Integer(reader.u32()?),
                tags::FLOAT => Constant::Float(reader.u32()?),
                tags::LONG => Constant::Long(reader.u64()?),
                tags::DOUBLE => Constant::Double(reader.u64()?),
                tags::CLASS => Constant::Class(reader.u16()?),
                tags::STRING => Constant::String(reader.u16()?),
                tags::FIELDREF => Constant::Fieldref(reader.u16()?, reader.u16()?),
                tags::METHODREF => Constant::Methodref(reader.u16()?, reader.u16()?),
                tags::INTERFACE_METHODREF => {
                    Constant::InterfaceMethodref(reader.u16()?, reader.u16()?)
                }
                tags::NAME_AND_TYPE => Constant::NameAndType(reader.u16()?, reader.u16()?),
                tags::METHOD_HANDLE => Constant::MethodHandle(reader.u8()?, reader.u16()?),
                tags::METHOD_TYPE => Constant::MethodType(reader.u16()?),
                tags::DYNAMIC => Constant::Dynamic(reader.u16()?, reader.u16()?),
                tags::INVOKE_DYNAMIC => Constant::InvokeDynamic(reader.u16()?, reader.u16()?),
                tags::MODULE => Constant::Module(reader.u16()?),
                tags::PACKAGE => Constant::Package(reader.u16()?),
                _ => anyhow::bail!("unsupported constant pool tag: {}", tag),
            };
            let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
            entries.push(constant);
            if wide {
                entries.push(Constant::Unusable);
            }
        }
        if entries.len() != count as usize {
            anyhow::bail!("constant pool overruns its declared count");
        }
        Ok(Self { entries })
    }

    fn write(&self, out: &mut Vec<u8>) {
        put_u16(out, self.entries.len() as u16);
        for constant in &self.entries {
            match constant {
                Constant::Utf8(bytes) => {
                    out.push(tags::UTF8);
                    put_u16(out, bytes.len() as u16);
                    out.extend_from_slice(bytes);
                }
                Constant::Integer(value) => {
                    out.push(tags::INTEGER);
                    put_u32(out, *value);
                }
                Constant::Float(value) => {
                    out.push(tags::FLOAT);
                    put_u32(out, *value);
                }
                Constant::Long(value) => {
                    out.push(tags::LONG);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                Constant::Double(value) => {
                    out.push(tags::DOUBLE);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                Constant::Class(index) => {
                    out.push(tags::CLASS);
                    put_u16(out, *index);
                }
                Constant::String(index) => {
                    out.push(tags::STRING);
                    put_u16(out, *index);
                }
                Constant::Fieldref(class, nat) => {
                    out.push(tags::FIELDREF);
                    put_u16(out, *class);
                    put_u16(out, *nat);
                }
                Constant::Methodref(class, nat) => {
                    out.push(tags::METHODREF);
                    put_u16(out, *class);
                    put_u16(out, *nat);
                }
                Constant::InterfaceMethodref(class, nat) => {
                    out.push(tags::INTERFACE_METHODREF);
                    put_u16(out, *class);
                    put_u16(out, *nat);
                }
                Constant::NameAndType(name, descriptor) => {
                    out.push(tags::NAME_AND_TYPE);
                    put_u16(out, *name);
                    put_u16(out, *descriptor);
                }
                Constant::MethodHandle(kind, reference) => {
                    out.push(tags::METHOD_HANDLE);
                    out.push(*kind);
                    put_u16(out, *reference);
                }
                Constant::MethodType(descriptor) => {
                    out.push(tags::METHOD_TYPE);
                    put_u16(out, *descriptor);
                }
                Constant::Dynamic(bootstrap, nat) => {
                    out.push(tags::DYNAMIC);
                    put_u16(out, *bootstrap);
                    put_u16(out, *nat);
                }
                Constant::InvokeDynamic(bootstrap, nat) => {
                    out.push(tags::INVOKE_DYNAMIC);
                    put_u16(out, *bootstrap);
                    put_u16(out, *nat);
                }
                Constant::Module(name) => {
                    out.push(tags::MODULE);
                    put_u16(out, *name);
                }
                Constant::Package(name) => {
                    out.push(tags::PACKAGE);
                    put_u16(out, *name);
                }
                Constant::Unusable => {}
            }
        }
    }

    pub(crate) fn get(&self, index: u16) -> Result<&Constant> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => {
                anyhow::bail!("invalid constant pool index: {}", index)
            }
            Some(constant) => Ok(constant),
        }
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::Utf8(bytes) => decode_modified_utf8(bytes)
                .with_context(|| format!("malformed utf8 constant at {index}")),
            _ => anyhow::bail!("constant {} is not utf8", index),
        }
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::Class(name_index) => self.utf8(*name_index),
            _ => anyhow::bail!("constant {} is not a class", index),
        }
    }

    pub(crate) fn name_and_type(&self, index: u16) -> Result<(String, String)> {
        match self.get(index)? {
            Constant::NameAndType(name, descriptor) => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            _ => anyhow::bail!("constant {} is not a name and type", index),
        }
    }

    pub(crate) fn member_ref(&self, index: u16) -> Result<MemberRef> {
        let (class_index, nat_index, interface) = match self.get(index)? {
            Constant::Methodref(class, nat) => (*class, *nat, false),
            Constant::InterfaceMethodref(class, nat) => (*class, *nat, true),
            _ => anyhow::bail!("constant {} is not a method reference", index),
        };
        let owner = self.class_name(class_index).context("resolve owner")?;
        let (name, descriptor) = self.name_and_type(nat_index)?;
        Ok(MemberRef {
            owner,
            name,
            descriptor,
            interface,
        })
    }

    pub(crate) fn method_handle(&self, index: u16) -> Result<MethodHandle> {
        match self.get(index)? {
            Constant::MethodHandle(kind, reference) => Ok(MethodHandle {
                kind: *kind,
                target: self.member_ref(*reference)?,
            }),
            _ => anyhow::bail!("constant {} is not a method handle", index),
        }
    }

    pub(crate) fn method_type(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::MethodType(descriptor) => self.utf8(*descriptor),
            _ => anyhow::bail!("constant {} is not a method type", index),
        }
    }

    /// Returns (bootstrap method attribute index, name, descriptor).
    pub(crate) fn invoke_dynamic(&self, index: u16) -> Result<(u16, String, String)> {
        match self.get(index)? {
            Constant::InvokeDynamic(bootstrap, nat) => {
                let (name, descriptor) = self.name_and_type(*nat)?;
                Ok((*bootstrap, name, descriptor))
            }
            _ => anyhow::bail!("constant {} is not invokedynamic", index),
        }
    }

    fn intern(&mut self, constant: Constant) -> Result<u16> {
        if let Some(index) = self.entries.iter().position(|entry| *entry == constant) {
            return Ok(index as u16);
        }
        let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
        let index = self.entries.len();
        let needed = if wide { 2 } else { 1 };
        if index + needed > u16::MAX as usize {
            anyhow::bail!("constant pool is out of space");
        }
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index as u16)
    }

    pub(crate) fn add_utf8(&mut self, value: &str) -> Result<u16> {
        self.intern(Constant::Utf8(encode_modified_utf8(value)))
    }

    pub(crate) fn add_class(&mut self, name: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        self.intern(Constant::Class(name_index))
    }

    pub(crate) fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.intern(Constant::NameAndType(name_index, descriptor_index))
    }

    pub(crate) fn add_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> Result<u16> {
        let class_index = self.add_class(owner)?;
        let nat_index = self.add_name_and_type(name, descriptor)?;
        if interface {
            self.intern(Constant::InterfaceMethodref(class_index, nat_index))
        } else {
            self.intern(Constant::Methodref(class_index, nat_index))
        }
    }

    pub(crate) fn add_method_handle(&mut self, kind: u8, reference: u16) -> Result<u16> {
        self.intern(Constant::MethodHandle(kind, reference))
    }

    pub(crate) fn add_invoke_dynamic(
        &mut self,
        bootstrap: u16,
        name: &str,
        descriptor: &str,
    ) -> Result<u16> {
        let nat_index = self.add_name_and_type(name, descriptor)?;
        self.intern(Constant::InvokeDynamic(bootstrap, nat_index))
    }

    #[cfg(test)]
    pub(crate) fn add_method_type(&mut self, descriptor: &str) -> Result<u16> {
        let descriptor_index = self.add_utf8(descriptor)?;
        self.intern(Constant::MethodType(descriptor_index))
    }
}

/// Attribute kept as raw bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct AttributeInfo {
    pub(crate) name_index: u16,
    pub(crate) info: Vec<u8>,
}

/// Field or method declaration.
#[derive(Clone, Debug)]
pub(crate) struct MemberInfo {
    pub(crate) access_flags: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) attributes: Vec<AttributeInfo>,
}

impl MemberInfo {
    pub(crate) fn name(&self, pool: &ConstantPool) -> Result<String> {
        pool.utf8(self.name_index)
    }

    pub(crate) fn descriptor(&self, pool: &ConstantPool) -> Result<String> {
        pool.utf8(self.descriptor_index)
    }

    pub(crate) fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub(crate) fn attribute(&self, pool: &ConstantPool, name: &str) -> Option<&AttributeInfo> {
        find_attribute(&self.attributes, pool, name)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ClassFile {
    pub(crate) minor_version: u16,
    pub(crate) major_version: u16,
    pub(crate) constant_pool: ConstantPool,
    pub(crate) access_flags: u16,
    pub(crate) this_class: u16,
    pub(crate) super_class: u16,
    pub(crate) interfaces: Vec<u16>,
    pub(crate) fields: Vec<MemberInfo>,
    pub(crate) methods: Vec<MemberInfo>,
    pub(crate) attributes: Vec<AttributeInfo>,
}

impl ClassFile {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        if reader.u32()? != MAGIC {
            anyhow::bail!("invalid class file magic");
        }
        let minor_version = reader.u16()?;
        let major_version = reader.u16()?;
        let constant_pool = ConstantPool::parse(&mut reader).context("parse constant pool")?;
        let access_flags = reader.u16()?;
        let this_class = reader.u16()?;
        let super_class = reader.u16()?;
        let interface_count = reader.u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(reader.u16()?);
        }
        let fields = parse_members(&mut reader).context("parse fields")?;
        let methods = parse_members(&mut reader).context("parse methods")?;
        let attributes = parse_attributes(&mut reader).context("parse class attributes")?;
        if !reader.is_empty() {
            anyhow::bail!("trailing bytes after class file");
        }
        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, MAGIC);
        put_u16(&mut out, self.minor_version);
        put_u16(&mut out, self.major_version);
        self.constant_pool.write(&mut out);
        put_u16(&mut out, self.access_flags);
        put_u16(&mut out, self.this_class);
        put_u16(&mut out, self.super_class);
        put_u16(&mut out, self.interfaces.len() as u16);
        for interface in &self.interfaces {
            put_u16(&mut out, *interface);
        }
        write_members(&mut out, &self.fields);
        write_members(&mut out, &self.methods);
        write_attributes(&mut out, &self.attributes);
        out
    }

    pub(crate) fn name(&self) -> Result<String> {
        self.constant_pool
            .class_name(self.this_class)
            .context("resolve class name")
    }

    pub(crate) fn super_name(&self) -> Result<Option<String>> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool
            .class_name(self.super_class)
            .context("resolve super class name")
            .map(Some)
    }

    pub(crate) fn interface_names(&self) -> Result<Vec<String>> {
        self.interfaces
            .iter()
            .map(|index| {
                self.constant_pool
                    .class_name(*index)
                    .context("resolve interface name")
            })
            .collect()
    }

    pub(crate) fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub(crate) fn attribute(&self, name: &str) -> Option<&AttributeInfo> {
        find_attribute(&self.attributes, &self.constant_pool, name)
    }

    pub(crate) fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    /// Replace the named class attribute, appending it when absent.
    pub(crate) fn set_attribute(&mut self, name: &str, info: Vec<u8>) -> Result<()> {
        let name_index = self.constant_pool.add_utf8(name)?;
        match self
            .attributes
            .iter_mut()
            .find(|attribute| attribute.name_index == name_index)
        {
            Some(attribute) => attribute.info = info,
            None => self.attributes.push(AttributeInfo { name_index, info }),
        }
        Ok(())
    }
}

fn find_attribute<'a>(
    attributes: &'a [AttributeInfo],
    pool: &ConstantPool,
    name: &str,
) -> Option<&'a AttributeInfo> {
    attributes
        .iter()
        .find(|attribute| matches!(pool.utf8(attribute.name_index), Ok(value) if value == name))
}

fn parse_members(reader: &mut ByteReader<'_>) -> Result<Vec<MemberInfo>> {
    let count = reader.u16()?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access_flags = reader.u16()?;
        let name_index = reader.u16()?;
        let descriptor_index = reader.u16()?;
        let attributes = parse_attributes(reader)?;
        members.push(MemberInfo {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
    }
    Ok(members)
}

fn write_members(out: &mut Vec<u8>, members: &[MemberInfo]) {
    put_u16(out, members.len() as u16);
    for member in members {
        put_u16(out, member.access_flags);
        put_u16(out, member.name_index);
        put_u16(out, member.descriptor_index);
        write_attributes(out, &member.attributes);
    }
}

pub(crate) fn parse_attributes(reader: &mut ByteReader<'_>) -> Result<Vec<AttributeInfo>> {
    let count = reader.u16()?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = reader.u16()?;
        let len = reader.u32()? as usize;
        let info = reader.bytes(len)?.to_vec();
        attributes.push(AttributeInfo { name_index, info });
    }
    Ok(attributes)
}

pub(crate) fn write_attributes(out: &mut Vec<u8>, attributes: &[AttributeInfo]) {
    put_u16(out, attributes.len() as u16);
    for attribute in attributes {
        put_u16(out, attribute.name_index);
        put_u32(out, attribute.info.len() as u32);
        out.extend_from_slice(&attribute.info);
    }
}

/// Exception table row of a Code attribute, in bytecode offsets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ExceptionEntry {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    pub(crate) catch_type: u16,
}

#[derive(Clone, Debug)]
pub(crate) struct CodeAttribute {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Vec<u8>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
    pub(crate) attributes: Vec<AttributeInfo>,
}

impl CodeAttribute {
    pub(crate) fn parse(info: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(info);
        let max_stack = reader.u16()?;
        let max_locals = reader.u16()?;
        let code_len = reader.u32()? as usize;
        let code = reader.bytes(code_len)?.to_vec();
        let handler_count = reader.u16()?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            exception_table.push(ExceptionEntry {
                start_pc: reader.u16()?,
                end_pc: reader.u16()?,
                handler_pc: reader.u16()?,
                catch_type: reader.u16()?,
            });
        }
        let attributes = parse_attributes(&mut reader)?;
        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.code.len() + 32);
        put_u16(&mut out, self.max_stack);
        put_u16(&mut out, self.max_locals);
        put_u32(&mut out, self.code.len() as u32);
        out.extend_from_slice(&self.code);
        put_u16(&mut out, self.exception_table.len() as u16);
        for entry in &self.exception_table {
            put_u16(&mut out, entry.start_pc);
            put_u16(&mut out, entry.end_pc);
            put_u16(&mut out, entry.handler_pc);
            put_u16(&mut out, entry.catch_type);
        }
        write_attributes(&mut out, &self.attributes);
        out
    }
}

/// Entry of the BootstrapMethods class attribute.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct BootstrapMethod {
    pub(crate) method_ref: u16,
    pub(crate) arguments: Vec<u16>,
}

pub(crate) fn parse_bootstrap_methods(info: &[u8]) -> Result<Vec<BootstrapMethod>> {
    let mut reader = ByteReader::new(info);
    let count = reader.u16()?;
    let mut methods = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let method_ref = reader.u16()?;
        let argument_count = reader.u16()?;
        let mut arguments = Vec::with_capacity(argument_count as usize);
        for _ in 0..argument_count {
            arguments.push(reader.u16()?);
        }
        methods.push(BootstrapMethod {
            method_ref,
            arguments,
        });
    }
    Ok(methods)
}

pub(crate) fn write_bootstrap_methods(methods: &[BootstrapMethod]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u16(&mut out, methods.len() as u16);
    for method in methods {
        put_u16(&mut out, method.method_ref);
        put_u16(&mut out, method.arguments.len() as u16);
        for argument in &method.arguments {
            put_u16(&mut out, *argument);
        }
    }
    out
}

/// Big-endian cursor over class file bytes.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .context("class file out of bounds")?;
        let slice = self
            .data
            .get(self.offset..end)
            .context("class file out of bounds")?;
        self.offset = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let high = self.u32()? as u64;
        let low = self.u32()? as u64;
        Ok((high << 32) | low)
    }
}

pub(crate) fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Decode the JVM's modified UTF-8 (CESU-8 surrogates, two-byte NUL).
fn decode_modified_utf8(bytes: &[u8]) -> Result<String> {
    if bytes.iter().all(|byte| *byte != 0 && *byte < 0x80) {
        return Ok(String::from_utf8_lossy(bytes).into_owned());
    }
    let mut units = Vec::with_capacity(bytes.len());
    let mut index = 0usize;
    while index < bytes.len() {
        let byte = bytes[index] as u16;
        if byte & 0x80 == 0 {
            units.push(byte);
            index += 1;
        } else if byte & 0xe0 == 0xc0 {
            let next = *bytes.get(index + 1).context("truncated sequence")? as u16;
            units.push(((byte & 0x1f) << 6) | (next & 0x3f));
            index += 2;
        } else if byte & 0xf0 == 0xe0 {
            let second = *bytes.get(index + 1).context("truncated sequence")? as u16;
            let third = *bytes.get(index + 2).context("truncated sequence")? as u16;
            units.push(((byte & 0x0f) << 12) | ((second & 0x3f) << 6) | (third & 0x3f));
            index += 3;
        } else {
            anyhow::bail!("invalid modified utf8 lead byte 0x{:02x}", byte);
        }
    }
    String::from_utf16(&units).context("invalid utf16 surrogates")
}

fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | ((unit >> 6) & 0x1f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | ((unit >> 12) & 0x0f) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}
