use crate::image::Snapshot;

const CELL: u16 = 2;

/// View of a stack living inside the snapshot.
///
/// The stack pointer itself is a system variable at `pointer_var`. Stacks
/// grow downwards: a push decrements the pointer and then stores.
pub struct Stack<'a> {
    image: &'a mut Snapshot,
    pointer_var: u16,
}

impl<'a> Stack<'a> {
    pub fn new(image: &'a mut Snapshot, pointer_var: u16) -> Self {
        Stack { image, pointer_var }
    }

    pub fn pointer(&self) -> u16 {
        self.image.get_word(self.pointer_var)
    }

    pub fn set_pointer(&mut self, ptr: u16) {
        self.image.set_word(self.pointer_var, ptr);
    }

    pub fn push(&mut self, val: u16) {
        let ptr = self.pointer().wrapping_sub(CELL);
        self.set_pointer(ptr);
        self.image.set_word(ptr, val);
    }

    pub fn pop(&mut self) -> u16 {
        let ptr = self.pointer();
        let val = self.image.get_word(ptr);
        self.set_pointer(ptr.wrapping_add(CELL));
        val
    }

    /// Cell `depth` positions below the top, 0 being the top.
    pub fn peek(&self, depth: u16) -> u16 {
        self.image
            .get_word(self.pointer().wrapping_add(depth.wrapping_mul(CELL)))
    }

    pub fn poke(&mut self, depth: u16, val: u16) {
        let addr = self.pointer().wrapping_add(depth.wrapping_mul(CELL));
        self.image.set_word(addr, val);
    }

    /// Push a double cell, high half on top.
    pub fn push_double(&mut self, val: u32) {
        self.push(val as u16);
        self.push((val >> 16) as u16);
    }

    pub fn pop_double(&mut self) -> u32 {
        let high = self.pop() as u32;
        let low = self.pop() as u32;
        (high << 16) | low
    }

    /// Cells between the pointer and `base`, top first.
    pub fn elements(&self, base: u16) -> Vec<u16> {
        let mut elements = Vec::new();
        let mut ptr = self.pointer();
        while ptr < base {
            elements.push(self.image.get_word(ptr));
            ptr = ptr.wrapping_add(CELL);
        }
        elements
    }
}

impl std::fmt::Debug for Stack<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Stack {{ pointer_var: {:#06x}, pointer: {:#06x} }}",
            self.pointer_var,
            self.pointer()
        )
    }
}

#[test]
fn test_stack_grows_down() {
    let mut image = Snapshot::blank();
    image.set_word(0x6112, 0xBB00);
    let mut stack = Stack::new(&mut image, 0x6112);
    stack.push(1);
    stack.push(2);
    assert_eq!(stack.pointer(), 0xBB00 - 4);
    assert_eq!(stack.peek(0), 2);
    assert_eq!(stack.peek(1), 1);
    assert_eq!(stack.elements(0xBB00), vec![2, 1]);
    assert_eq!(stack.pop(), 2);
    assert_eq!(stack.pop(), 1);
    assert_eq!(stack.pointer(), 0xBB00);
    assert!(stack.elements(0xBB00).is_empty());
    assert_eq!(image.get_word(0xBAFC), 2);
}

#[test]
fn test_stack_double() {
    let mut image = Snapshot::blank();
    image.set_word(0x6128, 0xBE00);
    let mut stack = Stack::new(&mut image, 0x6128);
    stack.push_double(0x1234_5678);
    assert_eq!(stack.peek(0), 0x1234);
    assert_eq!(stack.peek(1), 0x5678);
    stack.poke(1, 0x0001);
    assert_eq!(stack.pop_double(), 0x1234_0001);
}
