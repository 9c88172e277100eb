use kernel_alloc::FramePoolConfig;
use kernel_alloc::phys_mapper::HostPhysMemory;
use kernel_env::{EnvId, EnvStatus, Kernel, KernelError, Resume, Syscall, Sysno, TrapFrame};
use kernel_info::memory::{USTACKTOP, UTEXT, UTOP};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{FrameAlloc, PteFlags, SoftMmu};

const FRAMES: usize = 256;
const UP: PteFlags = PteFlags::USER.union(PteFlags::PRESENT);
const UPW: PteFlags = UP.union(PteFlags::WRITABLE);

fn va(v: u32) -> VirtualAddress {
    VirtualAddress::new(v)
}

/// A kernel with two empty environments, the receiver and the sender.
fn pair() -> (Kernel<HostPhysMemory, SoftMmu>, EnvId, EnvId) {
    let pool = FramePoolConfig::new(FRAMES).reserve(0..1);
    let mut k = Kernel::new(&pool, HostPhysMemory::with_frames(FRAMES), SoftMmu::new(), 8).unwrap();
    let a = k.env_alloc(EnvId::CURRENT).unwrap();
    let b = k.env_alloc(EnvId::CURRENT).unwrap();
    (k, a, b)
}

#[test]
fn value_only_message() {
    let (mut k, a, b) = pair();
    k.env_run(a).unwrap();
    let recv = Syscall::IpcRecv {
        dst: Some(va(0x0080_0000)),
    };
    assert_eq!(k.dispatch(recv), Resume::Suspend);
    assert!(k.envs().get(a.index()).ipc.recving);
    assert_eq!(k.envs().get(a.index()).status, EnvStatus::NotRunnable);

    k.env_run(b).unwrap();
    assert_eq!(k.ipc_try_send(a, 42, None, PteFlags::empty()), Ok(false));

    let env = k.envs().get(a.index());
    assert!(!env.ipc.recving);
    assert_eq!(env.ipc.from, b);
    assert_eq!(env.ipc.value, 42);
    assert!(env.ipc.perm.is_empty());
    assert_eq!(env.status, EnvStatus::Runnable);
    assert_eq!(env.tf.eax, 0);

    let space = k.space(a).unwrap();
    assert!(k.vm().lookup(space, va(0x0080_0000)).is_none());
}

#[test]
fn page_moves_when_both_sides_agree() {
    let (mut k, a, b) = pair();
    k.env_run(a).unwrap();
    k.ipc_recv(Some(va(0x00A0_0000))).unwrap();

    k.env_run(b).unwrap();
    k.sys_page_alloc(EnvId::CURRENT, va(0x0090_0000), UPW).unwrap();
    k.user_write(va(0x0090_0000), b"ping").unwrap();
    let send = Syscall::IpcTrySend {
        env: a,
        value: 7,
        src: Some(va(0x0090_0000)),
        perm: UP,
    };
    assert_eq!(k.dispatch(send), Resume::Return(1));

    let (sa, sb) = (k.space(a).unwrap(), k.space(b).unwrap());
    let frame = k.vm().lookup(sb, va(0x0090_0000)).unwrap().0;
    let leaf = k.vm().read_leaf(sa, va(0x00A0_0000)).unwrap();
    assert!(leaf.present() && !leaf.writable());
    assert_eq!(leaf.frame(), frame);
    assert_eq!(k.frames().refcount(frame), 2);
    assert_eq!(k.envs().get(a.index()).ipc.perm, UP);

    k.env_run(a).unwrap();
    let mut buf = [0u8; 4];
    k.user_read(va(0x00A0_0000), &mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

#[test]
fn page_is_not_moved_without_a_destination() {
    let (mut k, a, b) = pair();
    k.env_run(a).unwrap();
    k.ipc_recv(None).unwrap();

    k.env_run(b).unwrap();
    k.sys_page_alloc(EnvId::CURRENT, va(0x0090_0000), UPW).unwrap();
    assert_eq!(k.ipc_try_send(a, 1, Some(va(0x0090_0000)), UP), Ok(false));

    let sb = k.space(b).unwrap();
    let frame = k.vm().lookup(sb, va(0x0090_0000)).unwrap().0;
    assert_eq!(k.frames().refcount(frame), 1);
    assert!(k.envs().get(a.index()).ipc.perm.is_empty());
    let sa = k.space(a).unwrap();
    assert!(k.vm().mappings(sa).is_empty());
}

#[test]
fn receiver_is_untouched_when_its_page_table_cannot_be_allocated() {
    let (mut k, a, b) = pair();
    k.env_run(a).unwrap();
    k.ipc_recv(Some(va(0x00A0_0000))).unwrap();
    let before = k.envs().get(a.index()).clone();

    // Use up every frame; the sender's page table already exists.
    k.env_run(b).unwrap();
    k.sys_page_alloc(EnvId::CURRENT, va(0x0080_0000), UPW).unwrap();
    let mut next = 0x0080_1000;
    while k.sys_page_alloc(EnvId::CURRENT, va(next), UPW).is_ok() {
        next += 0x1000;
    }
    assert_eq!(k.frames().free_frames(), 0);
    let src = va(0x0080_0000);
    let sb = k.space(b).unwrap();
    let frame = k.vm().lookup(sb, src).unwrap().0;

    assert_eq!(k.ipc_try_send(a, 5, Some(src), UP), Err(KernelError::NoMem));

    let after = k.envs().get(a.index());
    assert_eq!(after.ipc, before.ipc);
    assert!(after.ipc.recving);
    assert_eq!(after.ipc.dst_va, Some(va(0x00A0_0000)));
    assert_eq!(after.status, EnvStatus::NotRunnable);
    assert_eq!(after.tf, before.tf);
    assert_eq!(k.frames().refcount(frame), 1);
    let sa = k.space(a).unwrap();
    assert!(k.vm().mappings(sa).is_empty());
}

#[test]
fn send_to_idle_target_leaves_it_untouched() {
    let (mut k, a, b) = pair();
    let before = k.envs().get(a.index()).clone();

    k.env_run(b).unwrap();
    assert_eq!(
        k.ipc_try_send(a, 42, None, PteFlags::empty()),
        Err(KernelError::IpcNotRecv)
    );
    let send = Syscall::IpcTrySend {
        env: a,
        value: 42,
        src: None,
        perm: PteFlags::empty(),
    };
    assert_eq!(k.dispatch(send), Resume::Return(-7));

    let after = k.envs().get(a.index());
    assert_eq!(after.ipc, before.ipc);
    assert_eq!(after.status, before.status);
    assert_eq!(after.tf, before.tf);
}

#[test]
fn second_sender_sees_not_receiving() {
    let (mut k, a, b) = pair();
    k.env_run(a).unwrap();
    k.ipc_recv(None).unwrap();

    k.env_run(b).unwrap();
    assert_eq!(k.ipc_try_send(a, 1, None, PteFlags::empty()), Ok(false));
    assert_eq!(
        k.ipc_try_send(a, 2, None, PteFlags::empty()),
        Err(KernelError::IpcNotRecv)
    );
    assert_eq!(k.envs().get(a.index()).ipc.value, 1);
}

#[test]
fn bad_source_pages_are_rejected_before_delivery() {
    let (mut k, a, b) = pair();
    k.env_run(a).unwrap();
    k.ipc_recv(Some(va(0x00A0_0000))).unwrap();

    k.env_run(b).unwrap();
    k.sys_page_alloc(EnvId::CURRENT, va(0x0090_0000), UP).unwrap();

    let cases = [
        (va(0x0090_0010), UP),
        (va(UTOP), UP),
        (va(0x0091_0000), UP),
        (va(0x0090_0000), UPW),
        (va(0x0090_0000), PteFlags::PRESENT),
        (va(0x0090_0000), UP | PteFlags::GLOBAL),
    ];
    for (src, perm) in cases {
        assert_eq!(
            k.ipc_try_send(a, 9, Some(src), perm),
            Err(KernelError::Inval),
            "{src} {perm:?}"
        );
    }
    let env = k.envs().get(a.index());
    assert!(env.ipc.recving);
    assert_eq!(env.status, EnvStatus::NotRunnable);
}

#[test]
fn unknown_target_is_bad_env() {
    let (mut k, a, b) = pair();
    k.env_run(b).unwrap();
    let stale = EnvId::from_raw(a.as_u32() + 0x1000);
    assert_eq!(
        k.ipc_try_send(stale, 0, None, PteFlags::empty()),
        Err(KernelError::BadEnv)
    );
    assert_eq!(
        k.ipc_try_send(EnvId::from_raw(0x1007), 0, None, PteFlags::empty()),
        Err(KernelError::BadEnv)
    );
}

#[test]
fn misaligned_receive_destination_is_invalid() {
    let (mut k, a, _) = pair();
    k.env_run(a).unwrap();
    let recv = Syscall::IpcRecv {
        dst: Some(va(0x0080_0004)),
    };
    assert_eq!(k.dispatch(recv), Resume::Return(-3));
    assert_eq!(k.ipc_recv(Some(va(UTOP))), Err(KernelError::Inval));
    assert!(!k.envs().get(a.index()).ipc.recving);
}

/// Load syscall registers into the running environment.
fn registers(k: &mut Kernel<HostPhysMemory, SoftMmu>, sysno: u32, args: [u32; 3]) {
    let tf = TrapFrame {
        eax: sysno,
        edx: args[0],
        ecx: args[1],
        ebx: args[2],
        eip: UTEXT,
        esp: USTACKTOP,
        ..TrapFrame::default()
    };
    k.env_set_trapframe(EnvId::CURRENT, tf).unwrap();
}

#[test]
fn blocked_receiver_is_skipped_until_woken() {
    let pool = FramePoolConfig::new(FRAMES).reserve(0..1);
    let mut k = Kernel::new(&pool, HostPhysMemory::with_frames(FRAMES), SoftMmu::new(), 8).unwrap();
    let idle = k.env_create(b"idle").unwrap();
    let a = k.env_create(b"a").unwrap();
    let b = k.env_create(b"b").unwrap();
    assert_eq!(idle.index(), 0);

    assert_eq!(k.schedule(), Some(a));
    registers(&mut k, Sysno::IpcRecv as u32, [0, 0, 0]);
    assert_eq!(k.syscall_trap(), Some(b));
    assert_eq!(k.schedule(), Some(b));

    registers(&mut k, Sysno::IpcTrySend as u32, [a.as_u32(), 99, 0]);
    assert_eq!(k.syscall_trap(), Some(b));
    assert_eq!(k.envs().get(b.index()).tf.eax, 0);

    assert_eq!(k.schedule(), Some(a));
    let env = k.envs().get(a.index());
    assert_eq!(env.tf.eax, 0);
    assert_eq!(env.ipc.value, 99);
    assert_eq!(env.ipc.from, b);
}
